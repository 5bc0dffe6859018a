//! # coinledger-ledger
//!
//! The **Ledger**: the only component that mutates balances.
//!
//! ## Guarantees
//!
//! 1. No bucket ever goes negative; a debit that would overdraw fails with
//!    [`InsufficientFunds`](coinledger_types::CoinledgerError::InsufficientFunds)
//!    and changes nothing.
//! 2. Multi-account work ([`Ledger::batch`]) locks accounts in ascending
//!    [`AccountId`](coinledger_types::AccountId) order with a bounded wait,
//!    so it cannot deadlock.
//! 3. Every mutation appends one hash-chained audit entry, made durable by
//!    the [`AuditSink`] before the balance is written back.
//! 4. Per bucket, `Σ balances + held == inflows − outflows`
//!    ([`SupplyConservation`]).

pub mod audit_log;
pub mod ledger;
pub mod locks;
pub mod supply;

pub use audit_log::{AuditSink, JsonlFileSink, MemorySink, verify_chain};
pub use ledger::{BalanceMismatch, Batch, Ledger};
pub use supply::SupplyConservation;
