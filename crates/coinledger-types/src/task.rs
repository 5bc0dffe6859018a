//! Deferred settlement tasks.
//!
//! A task is created synchronously with the ledger debit that funds it and is
//! completed exactly once by its drain. The state moves one way:
//!
//! ```text
//! Pending ──▶ Completed
//!    │
//!    └──────▶ Suspended ──(operator)──▶ Completed | Pending
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, TaskId};

/// The kind of deferred work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum TaskKind {
    MasternodeWithdraw,
    Unstake,
    MasternodeInvest,
    Rain,
    Airdrop,
    GroupPayout,
    LotteryTicket,
}

impl TaskKind {
    pub const ALL: [Self; 7] = [
        Self::MasternodeWithdraw,
        Self::Unstake,
        Self::MasternodeInvest,
        Self::Rain,
        Self::Airdrop,
        Self::GroupPayout,
        Self::LotteryTicket,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MasternodeWithdraw => "masternode-withdraw",
            Self::Unstake => "unstake",
            Self::MasternodeInvest => "masternode-invest",
            Self::Rain => "rain",
            Self::Airdrop => "airdrop",
            Self::GroupPayout => "group-payout",
            Self::LotteryTicket => "lottery-ticket",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific task data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Pay `amount` from the masternode wallet to `destination`.
    MasternodeWithdraw { destination: String },
    /// Pay `amount` from the staking-pool wallet to `destination`.
    Unstake { destination: String },
    /// Move funds to the masternode wallet, then credit the invested bucket.
    MasternodeInvest { amount_without_fee: Decimal },
    /// Escrowed reward; always paid.
    Rain,
    /// Feeder-funded reward; skipped while the feeder is short.
    Airdrop,
    /// Timed group payout. `amount` sits in escrow until `eligible_at`.
    GroupPayout {
        participants: Vec<AccountId>,
        max_recipients: usize,
    },
    /// A paid lottery ticket, settled by the next draw.
    LotteryTicket { value: u8 },
}

impl TaskPayload {
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::MasternodeWithdraw { .. } => TaskKind::MasternodeWithdraw,
            Self::Unstake { .. } => TaskKind::Unstake,
            Self::MasternodeInvest { .. } => TaskKind::MasternodeInvest,
            Self::Rain => TaskKind::Rain,
            Self::Airdrop => TaskKind::Airdrop,
            Self::GroupPayout { .. } => TaskKind::GroupPayout,
            Self::LotteryTicket { .. } => TaskKind::LotteryTicket,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Completed,
    /// The external outcome is unknown. Excluded from automatic retry until
    /// an operator resolves it.
    Suspended { reason: String },
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Suspended { .. } => write!(f, "SUSPENDED"),
        }
    }
}

/// Operator decision for a suspended task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The transfer is known to have happened.
    Completed,
    /// The transfer is known not to have happened; drain it again.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementTask {
    pub id: TaskId,
    pub owner: AccountId,
    pub amount: Decimal,
    pub payload: TaskPayload,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    /// The drain ignores the task before this instant.
    pub eligible_at: DateTime<Utc>,
    pub attempts: u32,
    pub completed_at: Option<DateTime<Utc>>,
    /// Broadcast transaction id, when the task moved funds on-chain.
    pub txid: Option<String>,
}

impl SettlementTask {
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == TaskState::Pending
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self.state, TaskState::Suspended { .. })
    }

    /// Pending and due at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.eligible_at <= now
    }
}
