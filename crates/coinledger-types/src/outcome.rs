//! Typed results handed back to the caller (the chat layer).
//!
//! The core never formats user messages; it returns one of these and lets
//! the caller decide how to render it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, TaskId};

/// A deferred task was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskScheduled {
    pub task: TaskId,
    pub amount: Decimal,
    pub eligible_at: DateTime<Utc>,
}

/// Result of an immediate on-chain send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Broadcast accepted.
    Sent {
        txid: String,
        /// What the recipient receives.
        net_amount: Decimal,
        /// Commission retained by the service.
        commission: Decimal,
    },
    /// The broadcast may or may not have happened. The debit stands and an
    /// incident was recorded for manual reconciliation.
    Ambiguous { reason: String },
}

/// Result of an unstake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnstakeOutcome {
    /// Pool mode: paid later by the unstaking drain.
    Scheduled(TaskScheduled),
    /// Individual mode: staking outputs swept back immediately.
    Swept { txid: String, amount: Decimal },
}

/// Result of a rain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RainOutcome {
    pub tasks: Vec<TaskId>,
    /// Equal share credited to each recipient.
    pub share: Decimal,
    /// Debited from the payer: `share × recipients`.
    pub total: Decimal,
}

/// How a group payout ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupPayoutResult {
    /// Nobody joined; the whole amount went back to the payer.
    Refunded { payer: AccountId, amount: Decimal },
    Paid {
        recipients: Vec<AccountId>,
        share: Decimal,
        /// Truncation remainder returned to the payer.
        dust: Decimal,
    },
}

/// A lottery ticket was paid for and waits for the next draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryTicketBought {
    pub task: TaskId,
    pub value: u8,
    /// Jackpot after this ticket.
    pub jackpot: Decimal,
}

/// One lottery draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryDraw {
    pub height: u64,
    pub block_hash: String,
    /// Last byte of the block hash.
    pub winning_value: u8,
    /// User tickets settled by this draw.
    pub tickets: usize,
    /// Owner of each winning user ticket.
    pub winners: Vec<AccountId>,
    /// Feeder-funded tickets bought for this draw.
    pub bot_tickets: usize,
    pub bot_winners: usize,
    /// Paid per winning ticket; zero when nobody won.
    pub win_amount: Decimal,
    pub jackpot_after: Decimal,
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Tasks (or items) examined.
    pub examined: usize,
    pub completed: usize,
    /// Not yet possible (feeder short, funds short); retried next cycle.
    pub deferred: usize,
    /// Moved to `Suspended`.
    pub suspended: usize,
    /// Failed this cycle; retried next cycle.
    pub failed: usize,
    /// The cycle ended early on a recoverable condition.
    pub aborted: bool,
    /// The cycle was skipped because another instance holds the guard.
    pub skipped: bool,
}

impl DrainReport {
    /// A report for a cycle that never ran.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_report() {
        let r = DrainReport::skipped();
        assert!(r.skipped);
        assert_eq!(r.completed, 0);
    }

    #[test]
    fn send_outcome_serde() {
        let o = SendOutcome::Sent {
            txid: "ab".into(),
            net_amount: Decimal::new(99, 1),
            commission: Decimal::new(1, 1),
        };
        let json = serde_json::to_string(&o).unwrap();
        let back: SendOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, o);
    }
}
