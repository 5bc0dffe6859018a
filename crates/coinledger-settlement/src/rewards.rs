//! Ledger-only payouts: rains, airdrops and timed group payouts.
//!
//! Each task's credit and its completion flag commit together under the
//! task store lock, so a re-drain never credits twice.

use chrono::{DateTime, Utc};
use coinledger_types::{
    AccountId, Bucket, CoinledgerError, DrainReport, GroupPayoutResult, OpTag, Result,
    SettlementTask, TaskId, TaskKind, TaskPayload, amount::truncate,
};
use rand::seq::SliceRandom;
use rust_decimal::Decimal;

use crate::pipeline::Pipeline;

impl Pipeline {
    /// Rains and airdrops in creation order.
    pub(crate) fn drain_rewards(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut tasks = self.tasks.eligible(TaskKind::Rain, now);
        tasks.extend(self.tasks.eligible(TaskKind::Airdrop, now));
        tasks.sort_by_key(|t| t.id);

        for task in tasks {
            report.examined += 1;
            let paid = match task.payload {
                TaskPayload::Rain => self.tasks.settle(task.id, None, now, |t| {
                    self.ledger
                        .transfer(AccountId::ESCROW, t.owner, Bucket::Native, t.amount, OpTag::RainPayout)
                }),
                TaskPayload::Airdrop => {
                    let feeder = self.ledger.balance(AccountId::FEEDER, Bucket::Native)?;
                    if feeder < task.amount {
                        tracing::debug!(task = %task.id, feeder = %feeder, "feeder short, airdrop deferred");
                        report.deferred += 1;
                        continue;
                    }
                    self.tasks.settle(task.id, None, now, |t| {
                        self.ledger
                            .transfer(AccountId::FEEDER, t.owner, Bucket::Native, t.amount, OpTag::Airdrop)
                    })
                }
                _ => continue,
            };
            match paid {
                Ok(()) => report.completed += 1,
                Err(CoinledgerError::InsufficientFunds { .. }) if task.kind() == TaskKind::Airdrop => {
                    report.deferred += 1;
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "reward credit failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Group payouts whose execute time has passed.
    pub(crate) fn drain_group_payouts(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        for task in self.tasks.eligible(TaskKind::GroupPayout, now) {
            report.examined += 1;
            match self.execute_group_payout(task.id, now) {
                Ok(_) => report.completed += 1,
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "group payout failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Pay one group payout out of escrow now.
    pub fn execute_group_payout(&self, id: TaskId, now: DateTime<Utc>) -> Result<GroupPayoutResult> {
        let result = self
            .tasks
            .settle(id, None, now, |task| self.split_group_payout(task))?;
        tracing::info!(task = %id, ?result, "group payout executed");
        Ok(result)
    }

    fn split_group_payout(&self, task: &SettlementTask) -> Result<GroupPayoutResult> {
        let TaskPayload::GroupPayout {
            participants,
            max_recipients,
        } = &task.payload
        else {
            return Err(CoinledgerError::invalid(format!("{} is not a group payout", task.id)));
        };
        let payer = task.owner;
        let refund = || -> Result<GroupPayoutResult> {
            self.ledger.transfer(
                AccountId::ESCROW,
                payer,
                Bucket::Native,
                task.amount,
                OpTag::GroupPayoutRefund,
            )?;
            Ok(GroupPayoutResult::Refunded {
                payer,
                amount: task.amount,
            })
        };
        if participants.is_empty() {
            return refund();
        }

        let k = (*max_recipients).clamp(1, participants.len());
        let mut recipients: Vec<AccountId> = participants
            .choose_multiple(&mut rand::thread_rng(), k)
            .copied()
            .collect();
        recipients.sort_unstable();
        let share = truncate(task.amount / Decimal::from(k));
        if share.is_zero() {
            return refund();
        }
        let dust = task.amount - share * Decimal::from(k);

        let mut accounts = recipients.clone();
        accounts.extend([AccountId::ESCROW, payer]);
        self.ledger.batch(&accounts, |b| {
            b.set_reference(task.id.to_string());
            for r in &recipients {
                b.transfer(AccountId::ESCROW, *r, Bucket::Native, share, OpTag::GroupPayout)?;
            }
            b.transfer(AccountId::ESCROW, payer, Bucket::Native, dust, OpTag::GroupPayoutRefund)
        })?;
        Ok(GroupPayoutResult::Paid {
            recipients,
            share,
            dust,
        })
    }
}
