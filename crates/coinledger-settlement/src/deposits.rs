//! Deposit crediting.
//!
//! The wallets report cumulative totals received per address. Each address
//! has a watermark of what was already credited; anything above it is
//! credited as a deposit. Watermarks live in the audit log itself (the
//! entry reference `deposit:{wallet}:{address}`), so a restart resumes
//! without crediting anything twice.

use std::collections::HashMap;

use coinledger_types::{
    AccountId, Bucket, CoinledgerError, DrainReport, OpTag, Result, WalletKind,
};
use rust_decimal::Decimal;

use crate::pipeline::Pipeline;

const REFERENCE_PREFIX: &str = "deposit:";

fn reference(wallet: WalletKind, address: &str) -> String {
    format!("{REFERENCE_PREFIX}{wallet}:{address}")
}

/// Wallets scanned for deposits and the bucket each credits.
const DEPOSIT_WALLETS: [(WalletKind, Bucket); 2] = [
    (WalletKind::Native, Bucket::Native),
    (WalletKind::Bitcoin, Bucket::Bitcoin),
];

impl Pipeline {
    fn load_watermarks(&self) -> Result<HashMap<String, Decimal>> {
        let mut marks = HashMap::new();
        for entry in self.ledger.audit_entries()? {
            if entry.op != OpTag::Deposit {
                continue;
            }
            if let Some(r) = entry.reference.filter(|r| r.starts_with(REFERENCE_PREFIX)) {
                *marks.entry(r).or_insert(Decimal::ZERO) += entry.delta;
            }
        }
        Ok(marks)
    }

    pub(crate) fn drain_deposits(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut guard = self
            .watermarks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load_watermarks()?);
        }
        let Some(marks) = guard.as_mut() else {
            return Ok(report);
        };

        let accounts = self.ledger.accounts()?;
        for (kind, bucket) in DEPOSIT_WALLETS {
            let owners: HashMap<&str, AccountId> = accounts
                .iter()
                .filter_map(|a| a.address(kind).map(|addr| (addr, a.id)))
                .collect();
            let received = self
                .wallet(kind)
                .list_received_by_address(self.config.confirmations_needed)
                .map_err(|e| CoinledgerError::from_gateway(&kind.to_string(), e))?;

            for r in received {
                let Some(owner) = owners.get(r.address.as_str()).copied() else {
                    continue;
                };
                report.examined += 1;
                let key = reference(kind, &r.address);
                let credited = marks.get(&key).copied().unwrap_or_default();
                let fresh = r.amount - credited;
                if fresh <= Decimal::ZERO {
                    continue;
                }
                let result = self.ledger.batch(&[owner], |b| {
                    b.set_reference(key.clone());
                    b.credit(owner, bucket, fresh, OpTag::Deposit)
                });
                match result {
                    Ok(()) => {
                        marks.insert(key, r.amount);
                        tracing::info!(account = %owner, bucket = %bucket, amount = %fresh, "deposit credited");
                        report.completed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(account = %owner, error = %e, "deposit credit failed");
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
