//! # coinledger-matchcore
//!
//! **Continuous order matching for the coin/bitcoin book.**
//!
//! - **Price-time priority**: best price first, then earliest arrival
//! - **Resting price wins**: every fill executes at the maker's price
//! - **Pre-funded orders**: reservations, fills, refunds and cancellations
//!   all move through the ledger in atomic batches
//! - **Fill tape**: append-only fills with a reproducible digest

pub mod engine;
pub mod fill_tape;
pub mod orderbook;

pub use engine::{MatchingEngine, Placement};
pub use fill_tape::{compute_fill_root, fill_root_hex};
pub use orderbook::{DepthLevel, OrderBook};
