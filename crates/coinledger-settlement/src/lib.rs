//! # coinledger-settlement
//!
//! **Settlement plane**: everything that moves coin between the ledger and
//! the wallet daemons.
//!
//! ## Architecture
//!
//! Synchronous treasury operations ([`treasury`]) validate, debit the
//! ledger and either broadcast immediately or create a deferred
//! [`SettlementTask`](coinledger_types::SettlementTask). Background drains
//! ([`Pipeline::run_drain`]) then:
//! 1. pick the eligible tasks of one kind, oldest first,
//! 2. re-derive input selection from the wallet's current state,
//! 3. broadcast, classifying the result as sent, inputs-spent or ambiguous,
//! 4. flip the task's one-way completion flag.
//!
//! Every drain kind is single-flight; masternode withdrawals and collateral
//! allocation share one guard because they spend the same outputs.
//! Ambiguous sends are never reversed: the task is suspended for an
//! operator and shows up in the [`ReconciliationReport`].

pub mod addresses;
pub mod collateral;
pub mod deposits;
pub mod distribution;
pub mod invest;
pub mod lottery;
pub mod pipeline;
pub mod reconciliation;
pub mod rewards;
pub mod single_flight;
pub mod task_store;
pub mod transaction;
pub mod treasury;
pub mod withdrawal;
pub mod worker;

pub use addresses::AddressBook;
pub use collateral::SlotRegistry;
pub use pipeline::{DrainKind, Pipeline, Wallets};
pub use reconciliation::{MismatchRow, ReconciliationReport};
pub use single_flight::{FlightGuard, SingleFlight};
pub use task_store::{Incident, TaskDraft, TaskStore};
