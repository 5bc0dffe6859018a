//! Identifiers used throughout the ledger.
//!
//! Orders use UUIDv7 for time-ordered sorting. Accounts are keyed by the
//! integer identity of the external chat user; their natural ordering is the
//! global lock-acquisition order. Tasks and collateral slots use monotonic
//! integers handed out by their stores.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AccountId
// ---------------------------------------------------------------------------

/// Identity of a balance holder.
///
/// Ascending `AccountId` order is the **only** order in which per-account
/// locks may be taken when more than one account is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Shared pool that funds airdrops.
    pub const FEEDER: Self = Self(i64::MIN);

    /// Holding account for funds reserved by rains and group payouts.
    pub const ESCROW: Self = Self(i64::MIN + 1);

    /// The lottery jackpot, carried over between draws.
    pub const LOTTERY: Self = Self(i64::MIN + 2);

    /// Every account the ledger opens for itself.
    pub const SYSTEM: [Self; 3] = [Self::FEEDER, Self::ESCROW, Self::LOTTERY];

    /// System accounts are never owned by a user.
    #[must_use]
    pub fn is_system(self) -> bool {
        Self::SYSTEM.contains(&self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::FEEDER => write!(f, "acct:feeder"),
            Self::ESCROW => write!(f, "acct:escrow"),
            Self::LOTTERY => write!(f, "acct:lottery"),
            Self(id) => write!(f, "acct:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderId
// ---------------------------------------------------------------------------

/// Globally unique order identifier. Uses UUIDv7 for time-ordered sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OrderId(pub Uuid);

impl OrderId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse the textual form handed out to users.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| crate::CoinledgerError::not_found(format!("order {s}")))
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Identifier of a deferred settlement task. Monotonic in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SlotId
// ---------------------------------------------------------------------------

/// Identifier of a masternode collateral slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_uniqueness() {
        let a = OrderId::new();
        let b = OrderId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn order_id_parse_roundtrip() {
        let id = OrderId::new();
        assert_eq!(OrderId::parse(&id.to_string()).unwrap(), id);
        assert!(OrderId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn system_accounts_sort_first() {
        let telegram_user = AccountId(-10_000_000_000 + 42);
        let discord_user = AccountId(123_456_789);
        let mut ids = vec![discord_user, AccountId::ESCROW, telegram_user, AccountId::FEEDER];
        ids.sort();
        assert_eq!(
            ids,
            vec![AccountId::FEEDER, AccountId::ESCROW, telegram_user, discord_user]
        );
        assert!(AccountId::FEEDER.is_system());
        assert!(AccountId::LOTTERY.is_system());
        assert_eq!(AccountId::LOTTERY.to_string(), "acct:lottery");
        assert!(!discord_user.is_system());
    }

    #[test]
    fn display_forms() {
        assert_eq!(AccountId(5).to_string(), "acct:5");
        assert_eq!(AccountId::FEEDER.to_string(), "acct:feeder");
        assert_eq!(TaskId(9).to_string(), "task:9");
        assert_eq!(SlotId(2).to_string(), "slot:2");
    }

    #[test]
    fn serde_roundtrips() {
        let oid = OrderId::new();
        let json = serde_json::to_string(&oid).unwrap();
        let back: OrderId = serde_json::from_str(&json).unwrap();
        assert_eq!(oid, back);
    }
}
