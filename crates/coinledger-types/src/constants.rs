//! System-wide constants.

/// Fractional digits carried by every amount and price.
pub const AMOUNT_SCALE: u32 = 8;

/// Confirmations a deposit needs before it is credited (default).
pub const DEFAULT_CONFIRMATIONS_NEEDED: u32 = 2;

/// Block confirmations awaited after a node reload before starting a masternode.
pub const DEFAULT_COLLATERAL_CONFIRMATIONS: u64 = 15;

/// Default bounded wait for a per-account lock, in milliseconds.
pub const DEFAULT_LOCK_WAIT_MS: u64 = 2_000;

/// Default delay window for masternode withdrawals, in hours (inclusive).
pub const DEFAULT_MN_WITHDRAW_DELAY_HOURS: (u32, u32) = (6, 24);

/// Default delay window for pool unstaking, in hours (inclusive).
pub const DEFAULT_UNSTAKE_DELAY_HOURS: (u32, u32) = (2, 6);

/// Pause between two masternode investment transfers, in milliseconds.
pub const DEFAULT_INVEST_PAUSE_MS: u64 = 1_000;

/// Fee rate used when the node cannot estimate one (per kB).
pub const FALLBACK_FEE_PER_KB: &str = "0.0001";

/// Fee rate used when the node estimate is implausibly high (per kB).
pub const CAPPED_FEE_PER_KB: &str = "0.0009";

/// Node estimates above this are replaced by [`CAPPED_FEE_PER_KB`].
pub const MAX_SANE_FEE_PER_KB: &str = "0.1";

/// Signed-transaction size unit used for fee computation, in bytes.
pub const FEE_SIZE_UNIT_BYTES: usize = 1024;

/// Minimum masternode investment for accounts with less than
/// [`SMALL_INVESTOR_BALANCE`] already invested.
pub const MIN_FIRST_INVESTMENT: i64 = 10;

/// Invested balance below which [`MIN_FIRST_INVESTMENT`] applies.
pub const SMALL_INVESTOR_BALANCE: i64 = 2;

/// Price of one lottery ticket, in coins.
pub const DEFAULT_LOTTERY_TICKET_PRICE: i64 = 10;

/// Below this many tickets' worth of jackpot, the feeder buys the difference.
pub const DEFAULT_LOTTERY_MIN_JACKPOT_TICKETS: u32 = 10;

/// The literal success body returned by the node-management service.
pub const NODE_SERVICE_OK: &str = "OK";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
