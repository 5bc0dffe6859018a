//! Error types for the coin ledger.
//!
//! All errors use the `CL_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Argument / lookup errors
//! - 2xx: Balance errors
//! - 3xx: Ledger / audit errors
//! - 4xx: Order errors
//! - 5xx: Settlement task errors
//! - 6xx: External collaborator errors
//! - 7xx: Collateral errors
//! - 9xx: General / internal errors

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AccountId, Bucket, GatewayError, TaskId};

/// Central error enum for all ledger, matching and settlement operations.
#[derive(Debug, Error)]
pub enum CoinledgerError {
    // =================================================================
    // Argument / Lookup Errors (1xx)
    // =================================================================
    /// Zero/negative amount or price, bad precision, malformed address.
    /// Always raised before any mutation.
    #[error("CL_ERR_100: Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The referenced entity is absent or already terminal.
    #[error("CL_ERR_101: Not found: {what}")]
    NotFound { what: String },

    // =================================================================
    // Balance Errors (2xx)
    // =================================================================
    /// Not enough funds in the bucket. No state was changed.
    #[error("CL_ERR_200: Insufficient funds in {bucket} of {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: AccountId,
        bucket: Bucket,
        needed: Decimal,
        available: Decimal,
    },

    // =================================================================
    // Ledger / Audit Errors (3xx)
    // =================================================================
    /// A per-account lock could not be acquired within the bounded wait.
    #[error("CL_ERR_300: Lock wait exceeded for account {0}")]
    LockTimeout(AccountId),

    /// The audit hash chain does not verify at the given sequence number.
    #[error("CL_ERR_301: Audit chain broken at entry {seq}")]
    AuditChainBroken { seq: u64 },

    /// Supply conservation invariant violated.
    #[error("CL_ERR_302: Supply invariant violation: {reason}")]
    SupplyInvariantViolation { reason: String },

    // =================================================================
    // Order Errors (4xx)
    // =================================================================
    /// The account already has the maximum number of live orders.
    #[error("CL_ERR_400: Account {account} already has {limit} open orders")]
    OrderLimitExceeded { account: AccountId, limit: usize },

    // =================================================================
    // Settlement Task Errors (5xx)
    // =================================================================
    /// The task's completion flag was already flipped.
    #[error("CL_ERR_500: Task {0} already completed")]
    AlreadyCompleted(TaskId),

    /// The account already has a pending request of this kind.
    #[error("CL_ERR_501: Account {account} already has a pending {kind} request")]
    PendingRequestExists { account: AccountId, kind: String },

    // =================================================================
    // External Collaborator Errors (6xx)
    // =================================================================
    /// Wallet gateway or node service unreachable / timed out.
    #[error("CL_ERR_600: External service unavailable ({service}): {reason}")]
    ExternalUnavailable { service: String, reason: String },

    /// The wallet reported that inputs were already consumed.
    /// Recoverable: release local locks and retry next cycle.
    #[error("CL_ERR_601: Inputs already spent (rpc code {code})")]
    AmbiguousInputsSpent { code: i32 },

    /// The wallet rejected the request outright.
    #[error("CL_ERR_602: Wallet rejected request (rpc code {code}): {message}")]
    WalletRejected { code: i32, message: String },

    /// The node service answered with something other than `OK`.
    #[error("CL_ERR_603: Node service refused {step}: {body}")]
    NodeServiceRefused { step: String, body: String },

    // =================================================================
    // Collateral Errors (7xx)
    // =================================================================
    /// No locked masternode output exists to derive the unit price from.
    #[error("CL_ERR_700: Collateral unit price unavailable")]
    CollateralPriceUnavailable,

    /// The broadcast collateral output never showed up in the wallet.
    #[error("CL_ERR_701: Collateral output for tx {txid} not found")]
    CollateralOutputMissing { txid: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("CL_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("CL_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("CL_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// I/O error (disk, audit sink).
    #[error("CL_ERR_903: I/O error: {0}")]
    Io(String),
}

impl CoinledgerError {
    /// Shorthand for [`CoinledgerError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`CoinledgerError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether a drain should simply retry this on its next cycle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalUnavailable { .. }
                | Self::AmbiguousInputsSpent { .. }
                | Self::LockTimeout(_)
                | Self::NodeServiceRefused { .. }
        )
    }

    /// Convert a gateway failure, naming the collaborator it came from.
    pub fn from_gateway(service: &str, err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(reason) => Self::ExternalUnavailable {
                service: service.to_string(),
                reason,
            },
            GatewayError::Timeout => Self::ExternalUnavailable {
                service: service.to_string(),
                reason: "timed out".to_string(),
            },
            GatewayError::InputsSpent { code } => Self::AmbiguousInputsSpent { code },
            GatewayError::Rejected { code, message } => Self::WalletRejected { code, message },
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, CoinledgerError>;

impl From<std::io::Error> for CoinledgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoinledgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = CoinledgerError::not_found("order 42");
        let msg = format!("{err}");
        assert!(msg.starts_with("CL_ERR_101"), "Got: {msg}");
    }

    #[test]
    fn insufficient_funds_display() {
        let err = CoinledgerError::InsufficientFunds {
            account: AccountId(7),
            bucket: Bucket::Native,
            needed: Decimal::new(100, 0),
            available: Decimal::new(50, 0),
        };
        let msg = format!("{err}");
        assert!(msg.contains("CL_ERR_200"));
        assert!(msg.contains("NATIVE"));
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn gateway_errors_map_onto_taxonomy() {
        let spent = CoinledgerError::from_gateway("masternode", GatewayError::InputsSpent { code: -26 });
        assert!(matches!(spent, CoinledgerError::AmbiguousInputsSpent { code: -26 }));
        assert!(spent.is_retryable());

        let timeout = CoinledgerError::from_gateway("native", GatewayError::Timeout);
        assert!(matches!(timeout, CoinledgerError::ExternalUnavailable { .. }));

        let rejected = CoinledgerError::from_gateway(
            "native",
            GatewayError::Rejected {
                code: -5,
                message: "bad address".into(),
            },
        );
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn all_errors_have_cl_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(CoinledgerError::LockTimeout(AccountId(1))),
            Box::new(CoinledgerError::CollateralPriceUnavailable),
            Box::new(CoinledgerError::AlreadyCompleted(TaskId(3))),
            Box::new(CoinledgerError::Internal("test".into())),
            Box::new(CoinledgerError::NodeServiceRefused {
                step: "reload".into(),
                body: "FAIL".into(),
            }),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(
                msg.starts_with("CL_ERR_"),
                "Error missing CL_ERR_ prefix: {msg}"
            );
        }
    }
}
