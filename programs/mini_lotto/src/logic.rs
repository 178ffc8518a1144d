use anchor_lang::prelude::*;

use crate::{Game, LottoError, MAX_CAPACITY};

// ── Implementation ids ───────────────────────────────────────────────────
// The registry's implementation slot holds one of these. Each id maps to a
// logic version compiled into this program.
pub const LOTTO_V1: Pubkey = Pubkey::new_from_array(*b"MiniLottoV1_____________________");
pub const LOTTO_V2: Pubkey = Pubkey::new_from_array(*b"MiniLottoV2_____________________");
pub const LOTTO_V3: Pubkey = Pubkey::new_from_array(*b"MiniLottoV3_____________________");
pub const LOTTO_V4: Pubkey = Pubkey::new_from_array(*b"MiniLottoV4_____________________");

/// keccak256("eip1967.proxy.implementation") - 1.
/// A version must report exactly this marker to be installable.
pub const PROXIABLE_UUID: [u8; 32] = [
    0x36, 0x08, 0x94, 0xa1, 0x3b, 0xa1, 0xa3, 0x21, 0x06, 0x67, 0xc8, 0x28, 0x49, 0x2d, 0xb9, 0x8d,
    0xca, 0x3e, 0x20, 0x76, 0xcc, 0x37, 0x35, 0xa9, 0x20, 0xa3, 0xca, 0x50, 0x5d, 0x38, 0x2b, 0xbc,
];

static LOGIC_VERSIONS: [&dyn GameLogic; 4] = [&MiniLottoV1, &MiniLottoV2, &MiniLottoV3, &MiniLottoV4];

/// What happens to an expired game that never filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Every participant gets back `ticket_price` per ticket.
    Refund,
    /// The whole pool goes to one drawn participant.
    ForceDistribute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameTerms {
    pub capacity: u32,
    pub ticket_price: u64,
    pub expiry: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payout {
    pub recipient: Pubkey,
    pub lamports: u64,
}

/// Transfers owed once a game has been marked settled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    pub winner: Option<Pubkey>,
    pub payouts: Vec<Payout>,
}

impl Settlement {
    pub fn total(&self) -> u64 {
        self.payouts.iter().fold(0u64, |sum, payout| sum.saturating_add(payout.lamports))
    }
}

// ── Entropy ──────────────────────────────────────────────────────────────
// Not secure randomness: the slot hash, slot and timestamp are all known to
// the leader producing the block. Identical inputs give identical draws.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entropy {
    pub slot: u64,
    pub unix_timestamp: i64,
    pub recent_slot_hash: [u8; 32],
}

impl Entropy {
    /// Reads the most recent entry of the SlotHashes sysvar.
    /// Layout: u64 entry count, then `(u64 slot, [u8; 32] hash)` newest first.
    pub fn capture(clock: &Clock, slot_hashes: &AccountInfo) -> Result<Self> {
        let data = slot_hashes.try_borrow_data()?;
        let newest = data.get(16..48).ok_or(LottoError::EntropyUnavailable)?;
        let mut recent_slot_hash = [0u8; 32];
        recent_slot_hash.copy_from_slice(newest);

        Ok(Self {
            slot: clock.slot,
            unix_timestamp: clock.unix_timestamp,
            recent_slot_hash,
        })
    }

    /// Index into a pool of `participants` entries, always in `[0, participants)`.
    pub fn winner_index(&self, game_id: u64, participants: usize) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.recent_slot_hash);
        hasher.update(&self.slot.to_le_bytes());
        hasher.update(&self.unix_timestamp.to_le_bytes());
        hasher.update(&game_id.to_le_bytes());
        let digest = hasher.finalize();

        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        let roll = u64::from_le_bytes(word);
        (roll % participants.max(1) as u64) as usize
    }
}

pub fn ticket_cost(ticket_price: u64, num_tickets: u32) -> Result<u64> {
    ticket_price
        .checked_mul(num_tickets as u64)
        .ok_or_else(|| error!(LottoError::ArithmeticOverflow))
}

// ══════════════════════════════════════════════════════════════════════════
//  GAME LOGIC
// ══════════════════════════════════════════════════════════════════════════

/// One deployable version of the lottery rules.
///
/// The provided methods are the state machine every version shares; a
/// version only overrides the capability hooks that changed between
/// releases. Methods never move lamports: they mutate the game record and
/// return what must be paid, so callers can commit `settled` before any
/// transfer happens.
pub trait GameLogic: Sync {
    fn implementation(&self) -> Pubkey;

    fn version(&self) -> u8;

    fn proxiable_uuid(&self) -> Option<[u8; 32]> {
        Some(PROXIABLE_UUID)
    }

    /// Upper bound on tickets bought in one call, `None` for unbounded.
    fn max_tickets_per_purchase(&self) -> Option<u32> {
        None
    }

    fn min_creator_tickets(&self) -> u32 {
        1
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::ForceDistribute
    }

    /// Validates a new game and returns its opening pool.
    fn open_game(
        &self,
        terms: &GameTerms,
        num_tickets: u32,
        lamports: u64,
        creator: Pubkey,
        now: i64,
    ) -> Result<Vec<Pubkey>> {
        require!(terms.capacity > 1, LottoError::InvalidCapacity);
        require!(terms.capacity <= MAX_CAPACITY, LottoError::CapacityTooLarge);
        require!(terms.ticket_price > 0, LottoError::ZeroTicketPrice);
        require!(num_tickets >= self.min_creator_tickets(), LottoError::NoCreatorTicket);
        require!(num_tickets <= terms.capacity, LottoError::TooManyTickets);
        self.check_purchase_size(num_tickets)?;
        require!(terms.expiry == 0 || terms.expiry > now, LottoError::ExpirationInPast);
        require!(
            lamports == ticket_cost(terms.ticket_price, num_tickets)?,
            LottoError::IncorrectPayment
        );

        Ok(vec![creator; num_tickets as usize])
    }

    /// Appends `num_tickets` entries for `buyer`. Returns true when the
    /// purchase filled the pool; the caller must settle in the same call.
    fn buy_tickets(
        &self,
        game: &mut Game,
        buyer: Pubkey,
        num_tickets: u32,
        lamports: u64,
        now: i64,
    ) -> Result<bool> {
        require!(!game.is_full(), LottoError::GameEnded);
        require!(!game.is_expired(now), LottoError::GameExpired);
        require!(!game.settled, LottoError::GameEnded);
        require!(num_tickets > 0, LottoError::ZeroTickets);
        self.check_purchase_size(num_tickets)?;
        require!(num_tickets <= game.remaining_tickets(), LottoError::TooManyTickets);
        require!(
            lamports == ticket_cost(game.ticket_price, num_tickets)?,
            LottoError::IncorrectPayment
        );

        game.pool.extend(std::iter::repeat(buyer).take(num_tickets as usize));
        Ok(game.is_full())
    }

    /// Draws the winner of a game that just filled.
    fn settle_full(&self, game: &mut Game, entropy: &Entropy) -> Result<Settlement> {
        require!(game.is_full(), LottoError::GameNotFull);
        require!(!game.settled, LottoError::GameEnded);
        draw_winner(game, entropy)
    }

    /// Returns every participant's tickets on an expired, unfilled game.
    fn refund(&self, game: &mut Game, now: i64) -> Result<Settlement> {
        require!(
            self.expiry_policy() == ExpiryPolicy::Refund,
            LottoError::UnsupportedOperation
        );
        require_settleable(game, now, LottoError::AlreadyRefunded)?;

        let payouts = refund_payouts(game)?;
        game.settled = true;
        Ok(Settlement { winner: None, payouts })
    }

    /// Pays the pool of an expired, unfilled game to one drawn participant.
    fn distribute_prize(&self, game: &mut Game, now: i64, entropy: &Entropy) -> Result<Settlement> {
        require!(
            self.expiry_policy() == ExpiryPolicy::ForceDistribute,
            LottoError::UnsupportedOperation
        );
        require_settleable(game, now, LottoError::PrizeDistributed)?;
        draw_winner(game, entropy)
    }

    fn check_purchase_size(&self, num_tickets: u32) -> Result<()> {
        if let Some(limit) = self.max_tickets_per_purchase() {
            require!(num_tickets <= limit, LottoError::PurchaseLimitExceeded);
        }
        Ok(())
    }
}

fn require_settleable(game: &Game, now: i64, settled_error: LottoError) -> Result<()> {
    require!(!game.is_full(), LottoError::GameComplete);
    require!(game.is_expired(now), LottoError::NotExpired);
    if game.settled {
        return Err(settled_error.into());
    }
    Ok(())
}

/// Marks the game settled and assigns the whole pool to one entry.
/// An empty pool settles with nothing to pay.
fn draw_winner(game: &mut Game, entropy: &Entropy) -> Result<Settlement> {
    let prize = game.pooled_lamports()?;
    game.settled = true;

    if game.pool.is_empty() {
        return Ok(Settlement::default());
    }

    let winner = game.pool[entropy.winner_index(game.id, game.pool.len())];
    Ok(Settlement {
        winner: Some(winner),
        payouts: vec![Payout { recipient: winner, lamports: prize }],
    })
}

/// One payout per distinct participant, in order of first ticket.
fn refund_payouts(game: &Game) -> Result<Vec<Payout>> {
    let mut payouts: Vec<Payout> = Vec::new();
    for participant in &game.pool {
        match payouts.iter_mut().find(|payout| payout.recipient == *participant) {
            Some(payout) => {
                payout.lamports = payout
                    .lamports
                    .checked_add(game.ticket_price)
                    .ok_or(LottoError::ArithmeticOverflow)?;
            }
            None => payouts.push(Payout {
                recipient: *participant,
                lamports: game.ticket_price,
            }),
        }
    }
    Ok(payouts)
}

// ── Versions ─────────────────────────────────────────────────────────────

/// First release: one ticket per call, creator may open an empty game.
pub struct MiniLottoV1;

impl GameLogic for MiniLottoV1 {
    fn implementation(&self) -> Pubkey {
        LOTTO_V1
    }

    fn version(&self) -> u8 {
        1
    }

    fn max_tickets_per_purchase(&self) -> Option<u32> {
        Some(1)
    }

    fn min_creator_tickets(&self) -> u32 {
        0
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::Refund
    }
}

/// Batched purchases.
pub struct MiniLottoV2;

impl GameLogic for MiniLottoV2 {
    fn implementation(&self) -> Pubkey {
        LOTTO_V2
    }

    fn version(&self) -> u8 {
        2
    }

    fn min_creator_tickets(&self) -> u32 {
        0
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::Refund
    }
}

/// Creator must buy into their own game.
pub struct MiniLottoV3;

impl GameLogic for MiniLottoV3 {
    fn implementation(&self) -> Pubkey {
        LOTTO_V3
    }

    fn version(&self) -> u8 {
        3
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::Refund
    }
}

/// Expired games pay out to a drawn participant instead of refunding.
pub struct MiniLottoV4;

impl GameLogic for MiniLottoV4 {
    fn implementation(&self) -> Pubkey {
        LOTTO_V4
    }

    fn version(&self) -> u8 {
        4
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

pub fn resolve(implementation: &Pubkey) -> Option<&'static dyn GameLogic> {
    LOGIC_VERSIONS
        .iter()
        .copied()
        .find(|logic| logic.implementation() == *implementation)
}

/// Rejects ids with no deployed logic and logic without the upgrade marker.
pub fn check_upgrade_target(implementation: &Pubkey) -> Result<&'static dyn GameLogic> {
    verify_compatible(resolve(implementation))
}

pub fn verify_compatible(
    candidate: Option<&'static dyn GameLogic>,
) -> Result<&'static dyn GameLogic> {
    let logic = candidate.ok_or(LottoError::ImplementationNotContract)?;
    require!(
        logic.proxiable_uuid() == Some(PROXIABLE_UUID),
        LottoError::ImplementationNotUpgradeable
    );
    Ok(logic)
}
