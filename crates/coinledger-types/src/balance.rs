//! Account and balance-bucket types.
//!
//! Every account owns independent buckets. The staking balance shown to
//! users is *derived* (see [`StakingMode`]) and is not a bucket of its own
//! except for the pooled-accrual counter [`Bucket::StakingPool`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, WalletKind};

/// One of an account's independent balance fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Bucket {
    /// Spendable native coin.
    Native,
    /// Native coin invested into shared masternodes.
    Masternode,
    /// Spendable bitcoin.
    Bitcoin,
    /// Pooled staking accrual counter.
    StakingPool,
}

impl Bucket {
    pub const ALL: [Self; 4] = [Self::Native, Self::Masternode, Self::Bitcoin, Self::StakingPool];
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "NATIVE"),
            Self::Masternode => write!(f, "MASTERNODE"),
            Self::Bitcoin => write!(f, "BITCOIN"),
            Self::StakingPool => write!(f, "STAKING_POOL"),
        }
    }
}

/// How an account's staking balance is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StakingMode {
    /// Pooled-accrual counter minus pending unstakes.
    #[default]
    Pool,
    /// Sum of the account's own outputs on the staking wallet.
    Individual,
}

/// The four bucket values of one account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Balances {
    pub native: Decimal,
    pub masternode: Decimal,
    pub bitcoin: Decimal,
    pub staking_pool: Decimal,
}

impl Balances {
    #[must_use]
    pub fn get(&self, bucket: Bucket) -> Decimal {
        match bucket {
            Bucket::Native => self.native,
            Bucket::Masternode => self.masternode,
            Bucket::Bitcoin => self.bitcoin,
            Bucket::StakingPool => self.staking_pool,
        }
    }

    pub fn get_mut(&mut self, bucket: Bucket) -> &mut Decimal {
        match bucket {
            Bucket::Native => &mut self.native,
            Bucket::Masternode => &mut self.masternode,
            Bucket::Bitcoin => &mut self.bitcoin,
            Bucket::StakingPool => &mut self.staking_pool,
        }
    }

    /// Whether every bucket is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        Bucket::ALL.iter().all(|b| self.get(*b).is_zero())
    }
}

/// A balance holder. Only the ledger mutates `balances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balances: Balances,
    pub staking_mode: StakingMode,
    /// Deposit addresses, created lazily per wallet.
    pub addresses: BTreeMap<WalletKind, String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    #[must_use]
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            balances: Balances::default(),
            staking_mode: StakingMode::default(),
            addresses: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn address(&self, wallet: WalletKind) -> Option<&str> {
        self.addresses.get(&wallet).map(String::as_str)
    }
}

/// A change to an account's non-balance fields. Stored next to the audit
/// log so a replayed ledger keeps deposit addresses and staking modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum AccountChange {
    Address {
        account: AccountId,
        wallet: WalletKind,
        address: String,
    },
    StakingMode {
        account: AccountId,
        mode: StakingMode,
    },
}

impl AccountChange {
    #[must_use]
    pub fn account(&self) -> AccountId {
        match self {
            Self::Address { account, .. } | Self::StakingMode { account, .. } => *account,
        }
    }

    pub fn apply(&self, account: &mut Account) {
        match self {
            Self::Address { wallet, address, .. } => {
                account.addresses.insert(*wallet, address.clone());
            }
            Self::StakingMode { mode, .. } => account.staking_mode = *mode,
        }
    }
}
