//! Operator-facing reconciliation report.
//!
//! Ambiguous sends are never reversed automatically: the debit stands, the
//! task (if any) is suspended and an incident is recorded. This report
//! gathers everything an operator needs to settle them by hand, together
//! with the ledger's own consistency checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use coinledger_ledger::BalanceMismatch;
use coinledger_types::{
    AccountId, Bucket, CoinledgerError, Resolution, Result, SettlementTask, TaskId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{pipeline::Pipeline, task_store::Incident};

/// One bucket whose balance disagrees with its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchRow {
    pub account: AccountId,
    pub bucket: Bucket,
    pub balance: Decimal,
    pub audit_sum: Decimal,
}

impl From<BalanceMismatch> for MismatchRow {
    fn from(m: BalanceMismatch) -> Self {
        Self {
            account: m.account,
            bucket: m.bucket,
            balance: m.balance,
            audit_sum: m.audit_sum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub audit_chain_ok: bool,
    pub audit_chain_error: Option<String>,
    pub balance_mismatches: Vec<MismatchRow>,
    pub supply_ok: bool,
    pub supply_error: Option<String>,
    /// Tasks waiting for an operator decision.
    pub suspended: Vec<SettlementTask>,
    /// Every ambiguous send recorded so far, with or without a task.
    pub incidents: Vec<Incident>,
    /// Outstanding (non-completed) amount per task kind.
    pub pending_totals: BTreeMap<String, Decimal>,
}

impl ReconciliationReport {
    /// No broken chain, no mismatches, nothing suspended.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.audit_chain_ok
            && self.supply_ok
            && self.balance_mismatches.is_empty()
            && self.suspended.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoinledgerError::Serialization(e.to_string()))
    }
}

impl Pipeline {
    /// Snapshot the ledger checks and every open incident.
    pub fn reconciliation_report(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        let chain = self.ledger.verify_audit_chain();
        let supply = self.ledger.verify_supply();
        let balance_mismatches: Vec<MismatchRow> =
            self.ledger.reconcile()?.into_iter().map(MismatchRow::from).collect();
        let pending_totals = self
            .tasks
            .pending_totals()
            .into_iter()
            .map(|(kind, total)| (kind.as_str().to_string(), total))
            .collect();

        let report = ReconciliationReport {
            generated_at: now,
            audit_chain_ok: chain.is_ok(),
            audit_chain_error: chain.err().map(|e| e.to_string()),
            balance_mismatches,
            supply_ok: supply.is_ok(),
            supply_error: supply.err().map(|e| e.to_string()),
            suspended: self.tasks.suspended(),
            incidents: self.tasks.incidents(),
            pending_totals,
        };
        if !report.is_clean() {
            tracing::warn!(
                chain = report.audit_chain_ok,
                supply = report.supply_ok,
                mismatches = report.balance_mismatches.len(),
                suspended = report.suspended.len(),
                "reconciliation needs attention"
            );
        }
        Ok(report)
    }

    /// Apply an operator decision to a suspended task.
    pub fn resolve_suspended(
        &self,
        id: TaskId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SettlementTask> {
        self.tasks.resolve_suspended(id, resolution, now)
    }
}
