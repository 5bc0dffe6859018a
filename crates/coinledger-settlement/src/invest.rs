//! Masternode investment requests.
//!
//! Drained oldest first, one transfer at a time from the native wallet to
//! the masternode wallet, pausing between tasks. The native debit happened
//! at request time; a failed transfer only leaves the task pending.

use std::thread;

use chrono::{DateTime, Utc};
use coinledger_types::{Bucket, DrainReport, OpTag, Result, TaskKind, TaskPayload, WalletKind};

use crate::{
    pipeline::Pipeline,
    transaction::{Broadcast, send_funds},
};

impl Pipeline {
    pub(crate) fn drain_invest(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let tasks = self.tasks.eligible(TaskKind::MasternodeInvest, now);
        if tasks.is_empty() {
            return Ok(report);
        }
        let destination = self.addresses.service_address(WalletKind::Masternode)?;
        let change = self.addresses.service_address(WalletKind::Native)?;

        for (i, task) in tasks.into_iter().enumerate() {
            let TaskPayload::MasternodeInvest { amount_without_fee } = task.payload else {
                continue;
            };
            if i > 0 {
                thread::sleep(self.config.invest_pause());
            }
            report.examined += 1;
            self.tasks.record_attempt(task.id)?;

            let sent = send_funds(
                self.wallet(WalletKind::Native),
                &self.config,
                self.config.confirmations_needed,
                &destination,
                amount_without_fee,
                &change,
            );
            match sent {
                Ok(Broadcast::Sent(sent)) => {
                    let txid = sent.txid;
                    let credited = self.tasks.settle(task.id, Some(txid.clone()), now, |t| {
                        self.ledger.credit(
                            t.owner,
                            Bucket::Masternode,
                            amount_without_fee,
                            OpTag::InvestSettled,
                        )
                    });
                    match credited {
                        Ok(_) => {
                            tracing::info!(task = %task.id, account = %task.owner, amount = %amount_without_fee, "investment settled");
                            report.completed += 1;
                        }
                        Err(e) => {
                            self.tasks.suspend(
                                task.id,
                                &format!("sent {txid} but the masternode credit failed: {e}"),
                                now,
                            )?;
                            report.suspended += 1;
                        }
                    }
                }
                Ok(Broadcast::InputsSpent { code }) => {
                    tracing::warn!(task = %task.id, code, "investment inputs spent, retrying next cycle");
                    report.failed += 1;
                }
                Ok(Broadcast::Ambiguous { reason }) => {
                    self.tasks.suspend(task.id, &reason, now)?;
                    report.suspended += 1;
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "investment transfer failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
