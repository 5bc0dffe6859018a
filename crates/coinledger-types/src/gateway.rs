//! Narrow interfaces to the external collaborators: UTXO wallet daemons and
//! the masternode node-management service.
//!
//! The core never implements these. Every call is synchronous, bounded by a
//! client-side timeout, and failable at any point. A [`GatewayError::Timeout`]
//! on [`WalletGateway::send_raw_transaction`] is *ambiguous*: the broadcast
//! may have taken effect.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which wallet daemon a gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WalletKind {
    Native,
    Staking,
    StakingPool,
    Masternode,
    Bitcoin,
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Staking => write!(f, "staking"),
            Self::StakingPool => write!(f, "staking-pool"),
            Self::Masternode => write!(f, "masternode"),
            Self::Bitcoin => write!(f, "bitcoin"),
        }
    }
}

/// Reference to one transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    #[must_use]
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// An unspent output with its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: Decimal,
    /// Owning address, when the daemon reports it.
    pub address: Option<String>,
}

/// Total received by one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Received {
    pub address: String,
    pub amount: Decimal,
}

/// Newly generated rewards since a scan cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardScan {
    pub total: Decimal,
    /// Cursor to pass on the next scan; `None` keeps the previous one.
    pub cursor: Option<String>,
}

/// Failure talking to an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The client gave up waiting. The request may still have taken effect.
    #[error("timed out")]
    Timeout,
    /// RPC codes -25 / -26: inputs missing or already spent.
    #[error("inputs already spent (rpc code {code})")]
    InputsSpent { code: i32 },
    #[error("rejected (rpc code {code}): {message}")]
    Rejected { code: i32, message: String },
}

impl GatewayError {
    /// Classify a raw daemon error.
    #[must_use]
    pub fn from_rpc(code: i32, message: impl Into<String>) -> Self {
        match code {
            -25 | -26 => Self::InputsSpent { code },
            _ => Self::Rejected {
                code,
                message: message.into(),
            },
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// One UTXO wallet daemon.
pub trait WalletGateway: Send + Sync {
    fn kind(&self) -> WalletKind;

    fn list_unspent(&self, min_confirmations: u32) -> GatewayResult<Vec<Utxo>>;

    /// Outputs currently locked against automatic spending.
    fn list_lock_unspent(&self) -> GatewayResult<Vec<OutPoint>>;

    fn lock_unspent(&self, outputs: &[OutPoint]) -> GatewayResult<()>;

    fn unlock_unspent(&self, outputs: &[OutPoint]) -> GatewayResult<()>;

    /// Value of an arbitrary (possibly locked) output.
    fn output_amount(&self, output: &OutPoint) -> GatewayResult<Decimal>;

    fn create_address(&self, label: &str) -> GatewayResult<String>;

    fn validate_address(&self, address: &str) -> GatewayResult<bool>;

    /// Fee rate per kB. Negative when the daemon has no estimate.
    fn estimate_fee(&self, target_confirmations: u32) -> GatewayResult<Decimal>;

    fn create_raw_transaction(
        &self,
        inputs: &[OutPoint],
        outputs: &[(String, Decimal)],
    ) -> GatewayResult<String>;

    fn sign_raw_transaction(&self, hex: &str) -> GatewayResult<String>;

    /// Broadcast; returns the txid.
    fn send_raw_transaction(&self, hex: &str) -> GatewayResult<String>;

    fn get_balance(&self) -> GatewayResult<Decimal>;

    fn list_received_by_address(&self, min_confirmations: u32) -> GatewayResult<Vec<Received>>;

    fn block_count(&self) -> GatewayResult<u64>;

    /// Hex hash of the block at `height`.
    fn block_hash(&self, height: u64) -> GatewayResult<String>;

    /// Generated rewards received since `cursor`.
    fn rewards_since(&self, cursor: Option<&str>) -> GatewayResult<RewardScan>;

    // --- masternode wallet only ---

    /// Collateral-sized outputs the daemon recognises (refreshes its cache).
    fn masternode_outputs(&self) -> GatewayResult<Vec<OutPoint>>;

    /// Aliases of masternodes the daemon currently runs.
    fn list_masternodes(&self) -> GatewayResult<Vec<String>>;

    fn start_masternode(&self, alias: &str) -> GatewayResult<String>;
}

/// The node-management service that owns the masternode config file.
/// Both calls return the response body; only the literal `OK` is success.
pub trait NodeService: Send + Sync {
    fn post_config(&self, content: &str) -> GatewayResult<String>;

    fn reload(&self) -> GatewayResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_classify() {
        assert_eq!(GatewayError::from_rpc(-26, "x"), GatewayError::InputsSpent { code: -26 });
        assert_eq!(GatewayError::from_rpc(-25, "x"), GatewayError::InputsSpent { code: -25 });
        assert!(matches!(
            GatewayError::from_rpc(-5, "invalid address"),
            GatewayError::Rejected { code: -5, .. }
        ));
    }

    #[test]
    fn outpoint_display() {
        assert_eq!(OutPoint::new("abcd", 2).to_string(), "abcd:2");
    }

    #[test]
    fn wallet_kind_display() {
        assert_eq!(WalletKind::StakingPool.to_string(), "staking-pool");
    }
}
