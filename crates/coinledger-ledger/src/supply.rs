//! Supply conservation invariant checker.
//!
//! For every bucket:
//! ```text
//! Σ balances + held == Σ inflows − Σ outflows
//! ```
//! where *held* is value parked in open orders. Internal operations
//! (transfers, escrow moves, airdrops) must net to zero and never appear on
//! the right-hand side.

use std::collections::BTreeMap;

use coinledger_types::{AuditEntry, Bucket, CoinledgerError, Flow, Result};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    inflows: Decimal,
    outflows: Decimal,
    held: Decimal,
}

/// Tracks per-bucket external flows derived from audit entries.
#[derive(Debug, Clone, Default)]
pub struct SupplyConservation {
    totals: BTreeMap<Bucket, Totals>,
}

impl SupplyConservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one committed entry into the running totals.
    pub fn record(&mut self, entry: &AuditEntry) {
        let t = self.totals.entry(entry.bucket).or_default();
        match entry.op.flow() {
            Flow::Internal => {}
            Flow::Inflow => t.inflows += entry.delta,
            Flow::Outflow => t.outflows -= entry.delta,
            Flow::Hold | Flow::Release => t.held -= entry.delta,
        }
    }

    /// Expected Σ balances for `bucket`: inflows − outflows − held.
    #[must_use]
    pub fn expected_supply(&self, bucket: Bucket) -> Decimal {
        let t = self.totals.get(&bucket).copied().unwrap_or_default();
        t.inflows - t.outflows - t.held
    }

    #[must_use]
    pub fn total_inflows(&self, bucket: Bucket) -> Decimal {
        self.totals.get(&bucket).map_or(Decimal::ZERO, |t| t.inflows)
    }

    #[must_use]
    pub fn total_outflows(&self, bucket: Bucket) -> Decimal {
        self.totals.get(&bucket).map_or(Decimal::ZERO, |t| t.outflows)
    }

    /// Value currently parked outside balances (open order reservations).
    #[must_use]
    pub fn held(&self, bucket: Bucket) -> Decimal {
        self.totals.get(&bucket).map_or(Decimal::ZERO, |t| t.held)
    }

    /// Verify that the actual Σ balances matches the expected supply.
    ///
    /// # Errors
    /// Returns [`CoinledgerError::SupplyInvariantViolation`] if they differ.
    pub fn verify(&self, bucket: Bucket, actual_supply: Decimal) -> Result<()> {
        let expected = self.expected_supply(bucket);
        if actual_supply != expected {
            return Err(CoinledgerError::SupplyInvariantViolation {
                reason: format!(
                    "{bucket}: actual supply {actual_supply} != expected {expected} \
                     (inflows={}, outflows={}, held={})",
                    self.total_inflows(bucket),
                    self.total_outflows(bucket),
                    self.held(bucket),
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use coinledger_types::{AccountId, GENESIS_HASH, OpTag};

    use super::*;

    fn entry(bucket: Bucket, delta: i64, op: OpTag) -> AuditEntry {
        AuditEntry::chained(
            0,
            AccountId(1),
            bucket,
            Decimal::from(delta),
            Decimal::ZERO,
            op,
            None,
            GENESIS_HASH.to_string(),
        )
    }

    #[test]
    fn empty_supply_is_zero() {
        let sc = SupplyConservation::new();
        assert_eq!(sc.expected_supply(Bucket::Native), Decimal::ZERO);
        assert!(sc.verify(Bucket::Native, Decimal::ZERO).is_ok());
    }

    #[test]
    fn inflow_and_outflow() {
        let mut sc = SupplyConservation::new();
        sc.record(&entry(Bucket::Native, 1000, OpTag::Deposit));
        sc.record(&entry(Bucket::Native, -300, OpTag::ExternalSend));
        assert_eq!(sc.expected_supply(Bucket::Native), Decimal::from(700));
        assert_eq!(sc.total_outflows(Bucket::Native), Decimal::from(300));
        assert!(sc.verify(Bucket::Native, Decimal::from(700)).is_ok());
    }

    #[test]
    fn internal_moves_do_not_change_expectation() {
        let mut sc = SupplyConservation::new();
        sc.record(&entry(Bucket::Native, 100, OpTag::Deposit));
        sc.record(&entry(Bucket::Native, -40, OpTag::Transfer));
        sc.record(&entry(Bucket::Native, 40, OpTag::Transfer));
        assert_eq!(sc.expected_supply(Bucket::Native), Decimal::from(100));
    }

    #[test]
    fn holds_reduce_expected_balances_until_released() {
        let mut sc = SupplyConservation::new();
        sc.record(&entry(Bucket::Bitcoin, 50, OpTag::Deposit));
        sc.record(&entry(Bucket::Bitcoin, -30, OpTag::OrderReserve));
        assert_eq!(sc.held(Bucket::Bitcoin), Decimal::from(30));
        assert_eq!(sc.expected_supply(Bucket::Bitcoin), Decimal::from(20));
        sc.record(&entry(Bucket::Bitcoin, 30, OpTag::OrderFill));
        assert_eq!(sc.held(Bucket::Bitcoin), Decimal::ZERO);
        assert_eq!(sc.expected_supply(Bucket::Bitcoin), Decimal::from(50));
    }

    #[test]
    fn verify_fails_on_mismatch() {
        let mut sc = SupplyConservation::new();
        sc.record(&entry(Bucket::Bitcoin, 10, OpTag::Deposit));
        let err = sc.verify(Bucket::Bitcoin, Decimal::from(11)).unwrap_err();
        assert!(matches!(err, CoinledgerError::SupplyInvariantViolation { .. }));
        assert!(format!("{err}").contains("BITCOIN"));
    }
}
