//! Append-only, hash-chained audit entries.
//!
//! Every successful balance mutation produces exactly one [`AuditEntry`].
//! Entries chain through `prev_hash`, so any rewrite of history is
//! detectable by re-hashing from the genesis entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AccountId, Bucket};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// How an operation moves value relative to the ledger as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flow {
    /// Between accounts; nets to zero per bucket.
    Internal,
    /// Value entering from outside (deposit, reward, compensation).
    Inflow,
    /// Value leaving to the outside (withdrawal, external send).
    Outflow,
    /// Value parked outside any balance (order reservation).
    Hold,
    /// Parked value returning to a balance (fill, refund, cancel).
    Release,
}

/// Operation tag recorded with each audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpTag {
    Deposit,
    Reward,
    ExternalSend,
    Compensation,
    StakeOut,
    StakeIn,
    UnstakeSettled,
    MasternodeWithdrawRequest,
    InvestRequest,
    InvestSettled,
    Transfer,
    FeederDeposit,
    RainEscrow,
    RainPayout,
    Airdrop,
    GroupPayoutEscrow,
    GroupPayout,
    GroupPayoutRefund,
    /// Ticket price share added to the jackpot.
    LotteryTicket,
    /// Ticket price share kept by the service.
    LotteryHouseCut,
    /// Feeder-funded ticket topping up a thin jackpot.
    LotteryBotTicket,
    LotteryPayout,
    OrderReserve,
    OrderFill,
    OrderRefund,
    OrderCancel,
}

impl OpTag {
    #[must_use]
    pub fn flow(self) -> Flow {
        match self {
            Self::Deposit
            | Self::Reward
            | Self::Compensation
            | Self::StakeIn
            | Self::InvestSettled => Flow::Inflow,
            Self::ExternalSend
            | Self::StakeOut
            | Self::UnstakeSettled
            | Self::MasternodeWithdrawRequest
            | Self::InvestRequest
            | Self::LotteryHouseCut => Flow::Outflow,
            Self::Transfer
            | Self::FeederDeposit
            | Self::RainEscrow
            | Self::RainPayout
            | Self::Airdrop
            | Self::GroupPayoutEscrow
            | Self::GroupPayout
            | Self::GroupPayoutRefund
            | Self::LotteryTicket
            | Self::LotteryBotTicket
            | Self::LotteryPayout => Flow::Internal,
            Self::OrderReserve => Flow::Hold,
            Self::OrderFill | Self::OrderRefund | Self::OrderCancel => Flow::Release,
        }
    }
}

impl std::fmt::Display for OpTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deposit => "DEPOSIT",
            Self::Reward => "REWARD",
            Self::ExternalSend => "EXTERNAL_SEND",
            Self::Compensation => "COMPENSATION",
            Self::StakeOut => "STAKE_OUT",
            Self::StakeIn => "STAKE_IN",
            Self::UnstakeSettled => "UNSTAKE_SETTLED",
            Self::MasternodeWithdrawRequest => "MN_WITHDRAW_REQUEST",
            Self::InvestRequest => "INVEST_REQUEST",
            Self::InvestSettled => "INVEST_SETTLED",
            Self::Transfer => "TRANSFER",
            Self::FeederDeposit => "FEEDER_DEPOSIT",
            Self::RainEscrow => "RAIN_ESCROW",
            Self::RainPayout => "RAIN_PAYOUT",
            Self::Airdrop => "AIRDROP",
            Self::GroupPayoutEscrow => "GROUP_PAYOUT_ESCROW",
            Self::GroupPayout => "GROUP_PAYOUT",
            Self::GroupPayoutRefund => "GROUP_PAYOUT_REFUND",
            Self::LotteryTicket => "LOTTERY_TICKET",
            Self::LotteryHouseCut => "LOTTERY_HOUSE_CUT",
            Self::LotteryBotTicket => "LOTTERY_BOT_TICKET",
            Self::LotteryPayout => "LOTTERY_PAYOUT",
            Self::OrderReserve => "ORDER_RESERVE",
            Self::OrderFill => "ORDER_FILL",
            Self::OrderRefund => "ORDER_REFUND",
            Self::OrderCancel => "ORDER_CANCEL",
        };
        f.write_str(s)
    }
}

/// One balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub account: AccountId,
    pub bucket: Bucket,
    /// Signed change applied to the bucket.
    pub delta: Decimal,
    pub balance_after: Decimal,
    pub op: OpTag,
    /// Free-form correlation (order id, task id, txid).
    pub reference: Option<String>,
    pub at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Build the entry following `prev_hash`, computing its own hash.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn chained(
        seq: u64,
        account: AccountId,
        bucket: Bucket,
        delta: Decimal,
        balance_after: Decimal,
        op: OpTag,
        reference: Option<String>,
        prev_hash: String,
    ) -> Self {
        let mut entry = Self {
            seq,
            account,
            bucket,
            delta,
            balance_after,
            op,
            reference,
            at: Utc::now(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// SHA-256 over the previous hash and this entry's content, hex encoded.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"coinledger:audit:v1:");
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.account.0.to_le_bytes());
        hasher.update(self.bucket.to_string().as_bytes());
        hasher.update(self.delta.normalize().to_string().as_bytes());
        hasher.update(self.balance_after.normalize().to_string().as_bytes());
        hasher.update(self.op.to_string().as_bytes());
        if let Some(r) = &self.reference {
            hasher.update(r.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash matches the content.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prev: &str) -> AuditEntry {
        AuditEntry::chained(
            0,
            AccountId(1),
            Bucket::Native,
            Decimal::new(5, 0),
            Decimal::new(5, 0),
            OpTag::Deposit,
            Some("tx1".into()),
            prev.to_string(),
        )
    }

    #[test]
    fn hash_is_deterministic_and_hex() {
        let a = entry(GENESIS_HASH);
        let b = entry(GENESIS_HASH);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
        assert!(a.is_intact());
    }

    #[test]
    fn tampering_breaks_hash() {
        let mut a = entry(GENESIS_HASH);
        a.delta = Decimal::new(6, 0);
        assert!(!a.is_intact());
    }

    #[test]
    fn prev_hash_feeds_the_hash() {
        let a = entry(GENESIS_HASH);
        let b = entry(&a.hash);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn flows() {
        assert_eq!(OpTag::Deposit.flow(), Flow::Inflow);
        assert_eq!(OpTag::ExternalSend.flow(), Flow::Outflow);
        assert_eq!(OpTag::Transfer.flow(), Flow::Internal);
        assert_eq!(OpTag::OrderReserve.flow(), Flow::Hold);
        assert_eq!(OpTag::OrderCancel.flow(), Flow::Release);
    }

    #[test]
    fn serde_roundtrip_stays_intact() {
        let a = entry(GENESIS_HASH);
        let json = serde_json::to_string(&a).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert!(back.is_intact());
        assert_eq!(back, a);
    }
}
