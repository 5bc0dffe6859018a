//! Delayed payouts: masternode withdrawals and pool unstaking.
//!
//! Both pay out of a service wallet once the task's delay has passed. Input
//! selection is re-derived from the wallet on every attempt: locked outputs
//! that do not back collateral first, then unlocked outputs, in wallet
//! order. The fee comes out of the recipient's output. Outputs of a
//! collateral funding transaction that is still being resolved are left
//! alone.
//!
//! A task that fails for a reason retrying cannot fix is suspended with
//! the error text.
//!
//! A masternode withdrawal was debited at request time; an unstake debits
//! the pool counter only after the broadcast is accepted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use coinledger_types::{
    Bucket, CoinledgerError, DrainReport, OpTag, OutPoint, Result, TaskKind, TaskPayload, Utxo,
    WalletKind,
};
use rust_decimal::Decimal;

use crate::{
    collateral::Reclaim,
    pipeline::Pipeline,
    transaction::{Broadcast, Delivered, FeePayer, broadcast, build_signed, select_in_order},
};

/// How one payout attempt ended.
#[derive(Debug)]
enum Payout {
    Sent(Delivered),
    /// The wallet cannot cover the amount right now.
    Short,
    InputsSpent { code: i32 },
    Ambiguous { reason: String },
}

impl Pipeline {
    fn pay_out(&self, kind: WalletKind, destination: &str, amount: Decimal) -> Result<Payout> {
        let wallet = self.wallet(kind);
        let gw = |e| CoinledgerError::from_gateway(&kind.to_string(), e);
        let (collateral, funding) = if kind == WalletKind::Masternode {
            (self.slots.collateral_outputs(), self.slots.pending_txids())
        } else {
            (BTreeSet::new(), BTreeSet::new())
        };

        let mut locked = BTreeSet::new();
        let mut candidates = Vec::new();
        for outpoint in wallet.list_lock_unspent().map_err(gw)? {
            if collateral.contains(&outpoint) {
                continue;
            }
            let value = wallet.output_amount(&outpoint).map_err(gw)?;
            locked.insert(outpoint.clone());
            candidates.push(Utxo {
                outpoint,
                amount: value,
                address: None,
            });
        }
        candidates.extend(
            wallet
                .list_unspent(0)
                .map_err(gw)?
                .into_iter()
                .filter(|u| !funding.contains(&u.outpoint.txid)),
        );

        let Some((picked, total)) = select_in_order(candidates, amount) else {
            return Ok(Payout::Short);
        };
        let inputs: Vec<OutPoint> = picked.into_iter().map(|u| u.outpoint).collect();
        let unlock: Vec<OutPoint> = inputs.iter().filter(|o| locked.contains(*o)).cloned().collect();
        if !unlock.is_empty() {
            wallet.unlock_unspent(&unlock).map_err(gw)?;
        }

        let change = self.addresses.service_address(kind)?;
        let tx = build_signed(
            wallet,
            &self.config,
            &inputs,
            total,
            destination,
            amount,
            &change,
            FeePayer::Recipient,
        )?;
        Ok(match broadcast(wallet, &tx)? {
            Broadcast::Sent(sent) => Payout::Sent(sent),
            Broadcast::InputsSpent { code } => Payout::InputsSpent { code },
            Broadcast::Ambiguous { reason } => Payout::Ambiguous { reason },
        })
    }

    // =================================================================
    // Masternode withdrawals
    // =================================================================

    pub(crate) fn drain_withdrawals(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let tasks = self.tasks.eligible(TaskKind::MasternodeWithdraw, now);
        if tasks.is_empty() {
            return Ok(report);
        }
        self.relock_collateral()?;

        for task in tasks {
            let TaskPayload::MasternodeWithdraw { destination } = &task.payload else {
                continue;
            };
            report.examined += 1;
            self.tasks.record_attempt(task.id)?;
            let outcome = self.pay_out(WalletKind::Masternode, destination, task.amount);
            self.relock_collateral()?;

            match outcome {
                Ok(Payout::Sent(sent)) => {
                    self.tasks.complete(task.id, Some(sent.txid), now)?;
                    report.completed += 1;
                }
                Ok(Payout::Short) => match self.reclaim_collateral(task.amount)? {
                    Reclaim::NotEnough => report.deferred += 1,
                    Reclaim::Covered | Reclaim::Released(_) => {
                        // Freed or unconfirmed funds become spendable next cycle.
                        report.deferred += 1;
                        report.aborted = true;
                        break;
                    }
                },
                Ok(Payout::InputsSpent { code }) => {
                    tracing::warn!(task = %task.id, code, "withdrawal inputs spent, retrying next cycle");
                    report.failed += 1;
                    report.aborted = true;
                    break;
                }
                Ok(Payout::Ambiguous { reason }) => {
                    self.tasks.suspend(task.id, &reason, now)?;
                    report.suspended += 1;
                    report.aborted = true;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(task = %task.id, error = %e, "withdrawal failed, retrying next cycle");
                    report.failed += 1;
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    self.tasks.suspend(task.id, &e.to_string(), now)?;
                    report.suspended += 1;
                }
            }
        }
        Ok(report)
    }

    // =================================================================
    // Unstaking
    // =================================================================

    pub(crate) fn drain_unstaking(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        for task in self.tasks.eligible(TaskKind::Unstake, now) {
            let TaskPayload::Unstake { destination } = &task.payload else {
                continue;
            };
            report.examined += 1;

            let staked = self.ledger.balance(task.owner, Bucket::StakingPool)?;
            if staked < task.amount {
                self.tasks.suspend(
                    task.id,
                    &format!("staking pool balance {staked} below unstake amount {}", task.amount),
                    now,
                )?;
                report.suspended += 1;
                continue;
            }

            self.tasks.record_attempt(task.id)?;
            match self.pay_out(WalletKind::StakingPool, destination, task.amount) {
                Ok(Payout::Sent(sent)) => {
                    let txid = sent.txid;
                    let settled = self.tasks.settle(task.id, Some(txid.clone()), now, |t| {
                        self.ledger
                            .debit(t.owner, Bucket::StakingPool, t.amount, OpTag::UnstakeSettled)
                    });
                    match settled {
                        Ok(_) => report.completed += 1,
                        Err(e) => {
                            // Paid but not debited: never pay twice.
                            self.tasks.suspend(
                                task.id,
                                &format!("sent {txid} but the pool debit failed: {e}"),
                                now,
                            )?;
                            report.suspended += 1;
                        }
                    }
                }
                Ok(Payout::Short) => {
                    tracing::warn!(task = %task.id, amount = %task.amount, "staking pool wallet short");
                    report.deferred += 1;
                }
                Ok(Payout::InputsSpent { code }) => {
                    tracing::warn!(task = %task.id, code, "unstake inputs spent, retrying next cycle");
                    report.failed += 1;
                    report.aborted = true;
                    break;
                }
                Ok(Payout::Ambiguous { reason }) => {
                    self.tasks.suspend(task.id, &reason, now)?;
                    report.suspended += 1;
                    report.aborted = true;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(task = %task.id, error = %e, "unstake failed, retrying next cycle");
                    report.failed += 1;
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    self.tasks.suspend(task.id, &e.to_string(), now)?;
                    report.suspended += 1;
                }
            }
        }
        Ok(report)
    }
}
