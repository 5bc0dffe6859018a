//! # coinledger-types
//!
//! Shared types, errors, and configuration for the **coinledger** engine.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`AccountId`], [`OrderId`], [`TaskId`], [`SlotId`]
//! - **Balances**: [`Account`], [`Balances`], [`Bucket`], [`StakingMode`]
//! - **Order model**: [`Order`], [`OrderSide`], [`OrderStatus`], [`Fill`]
//! - **Settlement tasks**: [`SettlementTask`], [`TaskKind`], [`TaskPayload`], [`TaskState`]
//! - **Collateral**: [`CollateralSlot`] and masternode config rendering
//! - **Audit**: hash-chained [`AuditEntry`] with [`OpTag`] / [`Flow`]
//! - **Configuration**: [`EngineConfig`], [`LedgerConfig`], [`MarketConfig`], [`SettlementConfig`]
//! - **External collaborators**: [`WalletGateway`], [`NodeService`], [`GatewayError`]
//! - **Outcomes**: typed results returned to the caller
//! - **Errors**: [`CoinledgerError`] with `CL_ERR_` prefix codes
//! - **Constants**: system-wide defaults

pub mod amount;
pub mod audit;
pub mod balance;
pub mod config;
pub mod constants;
pub mod error;
pub mod fill;
pub mod gateway;
pub mod ids;
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;
pub mod order;
pub mod outcome;
pub mod slot;
pub mod task;

// Re-export all primary types at crate root:
//   use coinledger_types::{Order, OrderSide, Bucket, SettlementTask, ...};

pub use audit::*;
pub use balance::*;
pub use config::*;
pub use error::*;
pub use fill::*;
pub use gateway::*;
pub use ids::*;
pub use order::*;
pub use outcome::*;
pub use slot::*;
pub use task::*;

// Constants and amount helpers are accessed via their module paths
// (`coinledger_types::constants::FOO`, `coinledger_types::amount::truncate`).
