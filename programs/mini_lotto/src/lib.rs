#![allow(unexpected_cfgs)]

use anchor_lang::prelude::*;
use anchor_lang::solana_program::sysvar::slot_hashes;
use anchor_lang::solana_program::system_instruction;
use anchor_lang::solana_program::program::invoke;

pub mod logic;


use logic::{Entropy, GameLogic, GameTerms, Settlement};

declare_id!("AXm6nREvpBqF4dDiY7objY4hgVBVqFqYfkzP9R83288e");

// ── Constants ─────────────────────────────────────────────────────────────
pub const REGISTRY_SEED: &[u8] = b"registry";
pub const GAME_SEED:     &[u8] = b"game";
pub const MAX_CAPACITY:  u32   = 24;       // bounds the game account size
pub const IMPLEMENTATION_OFFSET: usize = 8; // registry slot, right after the discriminator

#[program]
pub mod mini_lotto {
    use super::*;

    // ── Initialize (installs the first implementation) ───────────
    pub fn initialize(ctx: Context<Initialize>, implementation: Pubkey) -> Result<()> {
        let admin = ctx.accounts.admin.key();
        let logic = ctx.accounts.registry.initialize(admin, implementation, ctx.bumps.registry)?;
        msg!("Registry initialized: admin={} version={}", admin, logic.version());
        emit!(Upgraded { implementation });
        Ok(())
    }

    // ── Upgrade (admin only, storage untouched) ───────────────────
    pub fn upgrade_to(ctx: Context<UpgradeTo>, new_implementation: Pubkey) -> Result<()> {
        let caller = ctx.accounts.caller.key();
        let logic = ctx.accounts.registry.upgrade_to(&caller, new_implementation)?;
        msg!("Upgraded to version {}", logic.version());
        emit!(Upgraded { implementation: new_implementation });
        Ok(())
    }

    // ── Create a game, creator buys the opening tickets ───────────
    pub fn create_game<'info>(
        ctx: Context<'_, '_, '_, 'info, CreateGame<'info>>,
        capacity: u32,
        ticket_price: u64,
        expiry: i64,
        num_tickets: u32,
        lamports: u64,
    ) -> Result<()> {
        let clock = Clock::get()?;
        let logic = ctx.accounts.registry.logic()?;
        let creator = ctx.accounts.creator.key();
        let terms = GameTerms { capacity, ticket_price, expiry };

        let pool = logic.open_game(&terms, num_tickets, lamports, creator, clock.unix_timestamp)?;
        let game_id = ctx.accounts.registry.register_game()?;
        ctx.accounts.game.set_inner(Game::open(game_id, ctx.bumps.game, &terms, pool));

        let vault = ctx.accounts.game.to_account_info();
        collect_payment(&ctx.accounts.creator, &vault, &ctx.accounts.system_program, lamports)?;

        emit!(NewGame { game_id, creator, capacity, ticket_price, expiry, tickets: num_tickets });

        if ctx.accounts.game.is_full() {
            let payer = ctx.accounts.creator.to_account_info();
            settle_filled(
                logic,
                &mut ctx.accounts.game,
                &vault,
                &clock,
                &ctx.accounts.slot_hashes,
                &payer,
                ctx.remaining_accounts,
            )?;
        }
        Ok(())
    }

    // ── Buy tickets, the filling purchase settles the game ────────
    pub fn buy_tickets<'info>(
        ctx: Context<'_, '_, '_, 'info, BuyTickets<'info>>,
        game_id: u64,
        num_tickets: u32,
        lamports: u64,
    ) -> Result<()> {
        let clock = Clock::get()?;
        let vault = ctx.accounts.game.to_account_info();
        let mut game = load_game_at(&ctx.accounts.registry, &vault, game_id)?;
        let logic = ctx.accounts.registry.logic()?;
        let buyer = ctx.accounts.buyer.key();

        let filled = logic.buy_tickets(&mut game, buyer, num_tickets, lamports, clock.unix_timestamp)?;
        store_game(&game, &vault)?;
        collect_payment(&ctx.accounts.buyer, &vault, &ctx.accounts.system_program, lamports)?;

        emit!(TicketsPurchased { game_id, buyer, tickets: num_tickets });

        if filled {
            let payer = ctx.accounts.buyer.to_account_info();
            settle_filled(
                logic,
                &mut game,
                &vault,
                &clock,
                &ctx.accounts.slot_hashes,
                &payer,
                ctx.remaining_accounts,
            )?;
        }
        Ok(())
    }

    // ── Refund an expired game (refund-policy versions) ───────────
    /// Participant wallets are passed as writable remaining accounts.
    pub fn refund<'info>(
        ctx: Context<'_, '_, '_, 'info, Refund<'info>>,
        game_id: u64,
    ) -> Result<()> {
        let now = Clock::get()?.unix_timestamp;
        let vault = ctx.accounts.game.to_account_info();
        let mut game = load_game_at(&ctx.accounts.registry, &vault, game_id)?;
        let logic = ctx.accounts.registry.logic()?;

        let settlement = logic.refund(&mut game, now)?;
        let caller = ctx.accounts.caller.to_account_info();
        commit_settlement(&game, &vault, &caller, ctx.remaining_accounts, &settlement)?;

        msg!("Game {} refunded to {} participants", game_id, settlement.payouts.len());
        emit!(Refunded { game_id, total: settlement.total() });
        Ok(())
    }

    // ── Force a draw on an expired game (distribute-policy versions)
    pub fn distribute_prize<'info>(
        ctx: Context<'_, '_, '_, 'info, DistributePrize<'info>>,
        game_id: u64,
    ) -> Result<()> {
        let clock = Clock::get()?;
        let vault = ctx.accounts.game.to_account_info();
        let mut game = load_game_at(&ctx.accounts.registry, &vault, game_id)?;
        let logic = ctx.accounts.registry.logic()?;

        let entropy = Entropy::capture(&clock, &ctx.accounts.slot_hashes)?;
        let settlement = logic.distribute_prize(&mut game, clock.unix_timestamp, &entropy)?;
        let caller = ctx.accounts.caller.to_account_info();
        commit_settlement(&game, &vault, &caller, ctx.remaining_accounts, &settlement)?;

        announce_winner(game_id, &settlement);
        Ok(())
    }

    // ── Views ─────────────────────────────────────────────────────
    pub fn get_participants(ctx: Context<ReadGame>, game_id: u64) -> Result<Vec<Pubkey>> {
        let game = load_game_at(&ctx.accounts.registry, &ctx.accounts.game, game_id)?;
        Ok(game.pool)
    }

    /// Summaries of the game accounts passed as remaining accounts. Callers
    /// page through `0..registry.game_count` by choosing which PDAs to pass.
    pub fn get_games(ctx: Context<ReadRegistry>) -> Result<Vec<GameSummary>> {
        let now = Clock::get()?.unix_timestamp;
        summarize_games(&ctx.accounts.registry, ctx.remaining_accounts, now)
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  HELPERS
// ══════════════════════════════════════════════════════════════════════════

/// Moves the ticket payment into the game account.
fn collect_payment<'info>(
    payer: &Signer<'info>,
    vault: &AccountInfo<'info>,
    system_program: &Program<'info, System>,
    lamports: u64,
) -> Result<()> {
    if lamports == 0 {
        return Ok(());
    }
    let ix = system_instruction::transfer(&payer.key(), vault.key, lamports);
    invoke(&ix, &[
        payer.to_account_info(),
        vault.clone(),
        system_program.to_account_info(),
    ])?;
    Ok(())
}

fn settle_filled<'info>(
    logic: &dyn GameLogic,
    game: &mut Game,
    vault: &AccountInfo<'info>,
    clock: &Clock,
    slot_hashes: &AccountInfo<'info>,
    payer: &AccountInfo<'info>,
    remaining: &[AccountInfo<'info>],
) -> Result<()> {
    let entropy = Entropy::capture(clock, slot_hashes)?;
    let settlement = logic.settle_full(game, &entropy)?;
    commit_settlement(game, vault, payer, remaining, &settlement)?;
    announce_winner(game.id, &settlement);
    Ok(())
}

/// Writes the settled record back, then pays out of the game account.
fn commit_settlement<'info>(
    game: &Game,
    vault: &AccountInfo<'info>,
    signer: &AccountInfo<'info>,
    remaining: &[AccountInfo<'info>],
    settlement: &Settlement,
) -> Result<()> {
    store_game(game, vault)?;
    disburse(vault, signer, remaining, settlement)
}

/// Pays each payout out of the game account. Recipients are looked up among
/// the signer and the remaining accounts.
fn disburse<'info>(
    vault: &AccountInfo<'info>,
    signer: &AccountInfo<'info>,
    remaining: &[AccountInfo<'info>],
    settlement: &Settlement,
) -> Result<()> {
    for payout in &settlement.payouts {
        let recipient = std::iter::once(signer)
            .chain(remaining.iter())
            .find(|account| *account.key == payout.recipient)
            .ok_or(LottoError::MissingParticipantAccount)?;
        require!(recipient.is_writable, LottoError::MissingParticipantAccount);

        let debited = vault
            .lamports()
            .checked_sub(payout.lamports)
            .ok_or(LottoError::ArithmeticOverflow)?;
        let credited = recipient
            .lamports()
            .checked_add(payout.lamports)
            .ok_or(LottoError::ArithmeticOverflow)?;
        **vault.try_borrow_mut_lamports()? = debited;
        **recipient.try_borrow_mut_lamports()? = credited;
    }
    Ok(())
}

fn announce_winner(game_id: u64, settlement: &Settlement) {
    match settlement.winner {
        Some(winner) => {
            let prize = settlement.total();
            msg!("Game {} won by {} for {} lamports", game_id, winner, prize);
            emit!(Winner { game_id, winner, prize });
        }
        None => msg!("Game {} settled with an empty pool", game_id),
    }
}

/// Loads game `game_id`. Ids the registry never issued fail with `invalid ID`
/// before the account is read.
fn load_game_at(registry: &Registry, account: &AccountInfo, game_id: u64) -> Result<Game> {
    registry.require_game(game_id)?;
    let game = load_game(registry, account)?;
    require!(game.id == game_id, LottoError::InvalidId);
    Ok(game)
}

/// Validates that `account` is a game PDA issued by this registry.
fn load_game(registry: &Registry, account: &AccountInfo) -> Result<Game> {
    require_keys_eq!(*account.owner, crate::ID, LottoError::InvalidId);
    let game = {
        let data = account.try_borrow_data()?;
        Game::try_deserialize(&mut &data[..])?
    };
    registry.require_game(game.id)?;

    let expected = Pubkey::create_program_address(
        &[GAME_SEED, &game.id.to_le_bytes(), &[game.bump]],
        &crate::ID,
    )
    .map_err(|_| LottoError::InvalidId)?;
    require_keys_eq!(*account.key, expected, LottoError::InvalidId);
    Ok(game)
}

fn store_game(game: &Game, account: &AccountInfo) -> Result<()> {
    let mut data = account.try_borrow_mut_data()?;
    let mut writer: &mut [u8] = &mut data[..];
    game.try_serialize(&mut writer)
}

fn summarize_games(
    registry: &Registry,
    accounts: &[AccountInfo],
    now: i64,
) -> Result<Vec<GameSummary>> {
    accounts
        .iter()
        .map(|account| load_game(registry, account).map(|game| game.summary(now)))
        .collect()
}

/// Reads the active implementation id straight out of raw registry data.
pub fn read_implementation_slot(data: &[u8]) -> Option<Pubkey> {
    data.get(IMPLEMENTATION_OFFSET..IMPLEMENTATION_OFFSET + 32)
        .and_then(|slot| Pubkey::try_from(slot).ok())
}

// ══════════════════════════════════════════════════════════════════════════
//  ACCOUNTS
// ══════════════════════════════════════════════════════════════════════════

#[derive(Accounts)]
pub struct Initialize<'info> {
    #[account(init, payer = admin, space = 8 + Registry::LEN,
              seeds = [REGISTRY_SEED], bump)]
    pub registry: Account<'info, Registry>,
    #[account(mut)] pub admin: Signer<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct UpgradeTo<'info> {
    #[account(mut, seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    pub caller: Signer<'info>,
}

#[derive(Accounts)]
#[instruction(capacity: u32)]
pub struct CreateGame<'info> {
    #[account(mut)] pub creator: Signer<'info>,
    #[account(mut, seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    #[account(init, payer = creator, space = 8 + Game::space(capacity),
              seeds = [GAME_SEED, registry.game_count.to_le_bytes().as_ref()], bump)]
    pub game: Account<'info, Game>,
    /// CHECK: address constrained to the SlotHashes sysvar
    #[account(address = slot_hashes::ID)]
    pub slot_hashes: UncheckedAccount<'info>,
    pub system_program: Program<'info, System>,
}

// Existing games are taken unchecked so an unknown id reports `invalid ID`
// instead of failing account deserialization. Handlers verify owner, PDA and
// id through `load_game_at`.

#[derive(Accounts)]
pub struct BuyTickets<'info> {
    #[account(mut)] pub buyer: Signer<'info>,
    #[account(seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    /// CHECK: verified by `load_game_at`
    #[account(mut)]
    pub game: UncheckedAccount<'info>,
    /// CHECK: address constrained to the SlotHashes sysvar
    #[account(address = slot_hashes::ID)]
    pub slot_hashes: UncheckedAccount<'info>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct Refund<'info> {
    #[account(mut)] pub caller: Signer<'info>,
    #[account(seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    /// CHECK: verified by `load_game_at`
    #[account(mut)]
    pub game: UncheckedAccount<'info>,
}

#[derive(Accounts)]
pub struct DistributePrize<'info> {
    #[account(mut)] pub caller: Signer<'info>,
    #[account(seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    /// CHECK: verified by `load_game_at`
    #[account(mut)]
    pub game: UncheckedAccount<'info>,
    /// CHECK: address constrained to the SlotHashes sysvar
    #[account(address = slot_hashes::ID)]
    pub slot_hashes: UncheckedAccount<'info>,
}

#[derive(Accounts)]
pub struct ReadGame<'info> {
    #[account(seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
    /// CHECK: verified by `load_game_at`
    pub game: UncheckedAccount<'info>,
}

#[derive(Accounts)]
pub struct ReadRegistry<'info> {
    #[account(seeds = [REGISTRY_SEED], bump = registry.bump)]
    pub registry: Account<'info, Registry>,
}

// ══════════════════════════════════════════════════════════════════════════
//  STATE
// ══════════════════════════════════════════════════════════════════════════

/// Persistent storage shared by every logic version. Field order is fixed:
/// the implementation id must stay at `IMPLEMENTATION_OFFSET`.
#[account]
pub struct Registry {
    pub implementation: Pubkey, // 32
    pub admin:          Pubkey, // 32
    pub game_count:     u64,    // 8
    pub bump:           u8,     // 1
}

impl Registry {
    pub const LEN: usize = 32 + 32 + 8 + 1;

    pub fn initialize(
        &mut self,
        admin: Pubkey,
        implementation: Pubkey,
        bump: u8,
    ) -> Result<&'static dyn GameLogic> {
        let logic = logic::check_upgrade_target(&implementation)?;
        self.implementation = implementation;
        self.admin = admin;
        self.game_count = 0;
        self.bump = bump;
        Ok(logic)
    }

    pub fn upgrade_to(
        &mut self,
        caller: &Pubkey,
        new_implementation: Pubkey,
    ) -> Result<&'static dyn GameLogic> {
        require_keys_eq!(*caller, self.admin, LottoError::Unauthorized);
        let logic = logic::check_upgrade_target(&new_implementation)?;
        self.implementation = new_implementation;
        Ok(logic)
    }

    pub fn logic(&self) -> Result<&'static dyn GameLogic> {
        logic::resolve(&self.implementation)
            .ok_or_else(|| error!(LottoError::ImplementationNotContract))
    }

    /// Hands out the next sequential game id.
    pub fn register_game(&mut self) -> Result<u64> {
        let id = self.game_count;
        self.game_count = id.checked_add(1).ok_or(LottoError::ArithmeticOverflow)?;
        Ok(id)
    }

    pub fn require_game(&self, game_id: u64) -> Result<()> {
        require!(game_id < self.game_count, LottoError::InvalidId);
        Ok(())
    }
}

/// One lottery round. `pool` holds one entry per ticket in purchase order,
/// so an address appears as many times as it bought tickets.
#[account]
pub struct Game {
    pub id:           u64,         // 8
    pub capacity:     u32,         // 4
    pub ticket_price: u64,         // 8
    pub expiry:       i64,         // 8  (0 = never)
    pub settled:      bool,        // 1
    pub bump:         u8,          // 1
    pub pool:         Vec<Pubkey>, // 4 + 32 * capacity
}

impl Game {
    pub const HEADER_LEN: usize = 8 + 4 + 8 + 8 + 1 + 1 + 4;

    /// Account size without the discriminator. Oversized capacities are
    /// clamped here and rejected by the logic before anything is stored.
    pub fn space(capacity: u32) -> usize {
        Self::HEADER_LEN + 32 * capacity.min(MAX_CAPACITY) as usize
    }

    pub fn open(id: u64, bump: u8, terms: &GameTerms, pool: Vec<Pubkey>) -> Self {
        Self {
            id,
            capacity: terms.capacity,
            ticket_price: terms.ticket_price,
            expiry: terms.expiry,
            settled: false,
            bump,
            pool,
        }
    }

    pub fn is_full(&self) -> bool {
        self.pool.len() >= self.capacity as usize
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry != 0 && now >= self.expiry
    }

    pub fn remaining_tickets(&self) -> u32 {
        self.capacity.saturating_sub(self.pool.len() as u32)
    }

    pub fn pooled_lamports(&self) -> Result<u64> {
        logic::ticket_cost(self.ticket_price, self.pool.len() as u32)
    }

    pub fn status(&self, now: i64) -> GameStatus {
        if self.is_full() {
            GameStatus::Complete
        } else if self.is_expired(now) {
            GameStatus::Expired
        } else {
            GameStatus::Active
        }
    }

    pub fn summary(&self, now: i64) -> GameSummary {
        GameSummary {
            id: self.id,
            capacity: self.capacity,
            ticket_price: self.ticket_price,
            expiry: self.expiry,
            tickets_sold: self.pool.len() as u32,
            settled: self.settled,
            status: self.status(now),
        }
    }
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameStatus {
    Active,
    Expired,
    Complete,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct GameSummary {
    pub id:           u64,
    pub capacity:     u32,
    pub ticket_price: u64,
    pub expiry:       i64,
    pub tickets_sold: u32,
    pub settled:      bool,
    pub status:       GameStatus,
}

// ══════════════════════════════════════════════════════════════════════════
//  ERRORS & EVENTS
// ══════════════════════════════════════════════════════════════════════════

#[error_code]
pub enum LottoError {
    #[msg("capacity must be greater than 1")]
    InvalidCapacity,
    #[msg("capacity exceeds the maximum pool size")]
    CapacityTooLarge,
    #[msg("ticket price can't be zero")]
    ZeroTicketPrice,
    #[msg("expiration must be in the future")]
    ExpirationInPast,
    #[msg("creator must purchase at least 1 ticket")]
    NoCreatorTicket,
    #[msg("numTickets exceed available tickets")]
    TooManyTickets,
    #[msg("you must send the exact ticket price")]
    IncorrectPayment,
    #[msg("invalid ID")]
    InvalidId,
    #[msg("game ended")]
    GameEnded,
    #[msg("game expired")]
    GameExpired,
    #[msg("must purchase at least 1 ticket")]
    ZeroTickets,
    #[msg("only one ticket per purchase")]
    PurchaseLimitExceeded,
    #[msg("game is not full")]
    GameNotFull,
    #[msg("game is complete")]
    GameComplete,
    #[msg("game has not expired")]
    NotExpired,
    #[msg("tickets have been refunded")]
    AlreadyRefunded,
    #[msg("prize has been distributed")]
    PrizeDistributed,
    #[msg("operation not supported by the active implementation")]
    UnsupportedOperation,
    #[msg("unauthorized, admin only")]
    Unauthorized,
    #[msg("new implementation is not a contract")]
    ImplementationNotContract,
    #[msg("new implementation is not UUPS")]
    ImplementationNotUpgradeable,
    #[msg("participant account missing")]
    MissingParticipantAccount,
    #[msg("slot hashes unavailable")]
    EntropyUnavailable,
    #[msg("arithmetic overflow")]
    ArithmeticOverflow,
}

#[event] pub struct Upgraded         { pub implementation: Pubkey }
#[event] pub struct NewGame          { pub game_id: u64, pub creator: Pubkey, pub capacity: u32, pub ticket_price: u64, pub expiry: i64, pub tickets: u32 }
#[event] pub struct TicketsPurchased { pub game_id: u64, pub buyer: Pubkey, pub tickets: u32 }
#[event] pub struct Winner           { pub game_id: u64, pub winner: Pubkey, pub prize: u64 }
#[event] pub struct Refunded         { pub game_id: u64, pub total: u64 }
