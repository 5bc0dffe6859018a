//! Synchronous, user-facing treasury operations.
//!
//! Every operation validates first, then mutates the ledger, and returns a
//! typed outcome. Immediate on-chain sends debit before broadcasting: an
//! unambiguous failure is undone with a compensating credit, an ambiguous
//! one leaves the debit standing and records an incident. Requests that pay
//! out later create their task under the task store lock, together with the
//! debit that funds them.

use chrono::{DateTime, Duration, Utc};
use coinledger_types::{
    AccountId, Bucket, CoinledgerError, OpTag, RainOutcome, Result, SendOutcome, StakingMode,
    TaskId, TaskKind, TaskPayload, TaskScheduled, UnstakeOutcome, Utxo, WalletKind,
    amount::{require_positive, truncate},
};
use rand::Rng;
use rust_decimal::Decimal;

use crate::{
    pipeline::Pipeline,
    task_store::TaskDraft,
    transaction::{Broadcast, FeePayer, broadcast, build_signed, select_smallest_first, send_funds},
};

/// Uniform whole-hour delay inside an inclusive window.
fn random_delay(window: (u32, u32)) -> Duration {
    let (lo, hi) = window;
    Duration::hours(i64::from(rand::thread_rng().gen_range(lo..=hi.max(lo))))
}

impl Pipeline {
    fn require_above_minimal(&self, amount: Decimal) -> Result<Decimal> {
        let amount = require_positive("amount", amount)?;
        let minimal = self.config.minimal_spend();
        if amount <= minimal {
            return Err(CoinledgerError::invalid(format!(
                "amount should be more than {minimal}"
            )));
        }
        Ok(amount)
    }

    fn require_valid_address(&self, kind: WalletKind, address: &str) -> Result<()> {
        let valid = self
            .wallet(kind)
            .validate_address(address)
            .map_err(|e| CoinledgerError::from_gateway(&kind.to_string(), e))?;
        if valid {
            Ok(())
        } else {
            Err(CoinledgerError::invalid(format!("invalid {kind} address: {address}")))
        }
    }

    /// Undo a debit whose send failed before taking effect.
    fn compensate(&self, account: AccountId, bucket: Bucket, amount: Decimal, now: DateTime<Utc>) {
        match self.ledger.credit(account, bucket, amount, OpTag::Compensation) {
            Ok(_) => tracing::info!(account = %account, bucket = %bucket, amount = %amount, "send failed, debit compensated"),
            Err(e) => self.tasks.record_incident(
                account,
                amount,
                &format!("compensating credit failed: {e}"),
                now,
            ),
        }
    }

    /// Turn a broadcast result into an outcome, compensating or recording
    /// an incident as the failure class demands.
    fn finish_send(
        &self,
        account: AccountId,
        bucket: Bucket,
        debited: Decimal,
        commission: Decimal,
        sent: Result<Broadcast>,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        match sent {
            Ok(Broadcast::Sent(sent)) => Ok(SendOutcome::Sent {
                txid: sent.txid,
                net_amount: sent.delivered,
                commission,
            }),
            Ok(Broadcast::InputsSpent { code }) => {
                self.compensate(account, bucket, debited, now);
                Err(CoinledgerError::AmbiguousInputsSpent { code })
            }
            Ok(Broadcast::Ambiguous { reason }) => {
                self.tasks.record_incident(account, debited, &reason, now);
                Ok(SendOutcome::Ambiguous { reason })
            }
            Err(e) => {
                self.compensate(account, bucket, debited, now);
                Err(e)
            }
        }
    }

    // =================================================================
    // Internal transfers
    // =================================================================

    /// Move native coin between two accounts.
    pub fn transfer(&self, from: AccountId, to: AccountId, amount: Decimal) -> Result<()> {
        let amount = self.require_above_minimal(amount)?;
        if from == to {
            return Err(CoinledgerError::invalid("cannot transfer to the same account"));
        }
        if to.is_system() {
            return Err(CoinledgerError::invalid(format!("{to} is not a user account")));
        }
        self.ledger.open_account(to);
        self.ledger
            .transfer(from, to, Bucket::Native, amount, OpTag::Transfer)?;
        tracing::info!(from = %from, to = %to, amount = %amount, "transfer");
        Ok(())
    }

    /// Move native coin into the shared pool that funds airdrops.
    pub fn feeder_deposit(&self, account: AccountId, amount: Decimal) -> Result<()> {
        let amount = require_positive("amount", amount)?;
        self.ledger.transfer(
            account,
            AccountId::FEEDER,
            Bucket::Native,
            amount,
            OpTag::FeederDeposit,
        )
    }

    // =================================================================
    // External sends
    // =================================================================

    /// Send native coin to an external address, keeping the commission.
    pub fn send_external(
        &self,
        account: AccountId,
        address: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let amount = self.require_above_minimal(amount)?;
        self.require_valid_address(WalletKind::Native, address)?;
        let net = amount - self.config.transaction_commission;
        let change = self.addresses.service_address(WalletKind::Native)?;

        self.ledger
            .debit(account, Bucket::Native, amount, OpTag::ExternalSend)?;
        let sent = send_funds(
            self.wallet(WalletKind::Native),
            &self.config,
            self.config.confirmations_needed,
            address,
            net,
            &change,
        );
        let outcome = self.finish_send(account, Bucket::Native, amount, amount - net, sent, now)?;
        if let SendOutcome::Sent { txid, .. } = &outcome {
            tracing::info!(account = %account, amount = %amount, txid = %txid, "external send");
        }
        Ok(outcome)
    }

    /// Send bitcoin to an external address. The network fee comes out of
    /// the amount received.
    pub fn send_bitcoin(
        &self,
        account: AccountId,
        address: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome> {
        let amount = require_positive("amount", amount)?;
        self.require_valid_address(WalletKind::Bitcoin, address)?;
        let change = self.addresses.service_address(WalletKind::Bitcoin)?;

        self.ledger
            .debit(account, Bucket::Bitcoin, amount, OpTag::ExternalSend)?;
        let sent = self.broadcast_bitcoin(address, amount, &change);
        self.finish_send(account, Bucket::Bitcoin, amount, Decimal::ZERO, sent, now)
    }

    fn broadcast_bitcoin(&self, address: &str, amount: Decimal, change: &str) -> Result<Broadcast> {
        let wallet = self.wallet(WalletKind::Bitcoin);
        let utxos = wallet
            .list_unspent(self.config.confirmations_needed)
            .map_err(|e| CoinledgerError::from_gateway("bitcoin", e))?;
        let available: Decimal = utxos.iter().map(|u| u.amount).sum();
        let (picked, total) = select_smallest_first(utxos, amount).ok_or_else(|| {
            CoinledgerError::WalletRejected {
                code: -6,
                message: format!("bitcoin wallet holds {available}, needs {amount}"),
            }
        })?;
        let inputs: Vec<_> = picked.into_iter().map(|u| u.outpoint).collect();
        let tx = build_signed(
            wallet,
            &self.config,
            &inputs,
            total,
            address,
            amount,
            change,
            FeePayer::Recipient,
        )?;
        broadcast(wallet, &tx)
    }

    // =================================================================
    // Staking
    // =================================================================

    /// The account's own outputs on the staking wallet.
    fn staking_outputs(&self, account: AccountId) -> Result<(String, Vec<Utxo>)> {
        let address = self.addresses.deposit_address(account, WalletKind::Staking)?;
        let outputs = self
            .wallet(WalletKind::Staking)
            .list_unspent(0)
            .map_err(|e| CoinledgerError::from_gateway("staking", e))?
            .into_iter()
            .filter(|u| u.address.as_deref() == Some(address.as_str()))
            .collect();
        Ok((address, outputs))
    }

    /// What the account has staked, derived from its staking mode.
    pub fn staking_balance(&self, account: AccountId) -> Result<Decimal> {
        let acct = self.ledger.account(account)?;
        match acct.staking_mode {
            StakingMode::Pool => Ok(acct.balances.staking_pool
                - self.tasks.pending_total(account, TaskKind::Unstake)),
            StakingMode::Individual => {
                let (_, outputs) = self.staking_outputs(account)?;
                Ok(outputs.iter().map(|u| u.amount).sum())
            }
        }
    }

    /// Stake native coin, into the pool or onto the account's own staking
    /// address depending on its mode.
    pub fn stake(&self, account: AccountId, amount: Decimal, now: DateTime<Utc>) -> Result<SendOutcome> {
        let amount = self.require_above_minimal(amount)?;
        let mode = self.ledger.account(account)?.staking_mode;
        let destination = match mode {
            StakingMode::Pool => self.addresses.service_address(WalletKind::StakingPool)?,
            StakingMode::Individual => self.addresses.deposit_address(account, WalletKind::Staking)?,
        };
        let net = amount - self.config.transaction_commission;
        let change = self.addresses.service_address(WalletKind::Native)?;

        self.ledger.debit(account, Bucket::Native, amount, OpTag::StakeOut)?;
        let sent = send_funds(
            self.wallet(WalletKind::Native),
            &self.config,
            self.config.confirmations_needed,
            &destination,
            net,
            &change,
        );
        let outcome = self.finish_send(account, Bucket::Native, amount, amount - net, sent, now)?;
        let txid = match &outcome {
            SendOutcome::Sent { txid, .. } => txid,
            SendOutcome::Ambiguous { .. } => return Ok(outcome),
        };
        if mode == StakingMode::Pool {
            if let Err(e) = self
                .ledger
                .credit(account, Bucket::StakingPool, net, OpTag::StakeIn)
            {
                self.tasks.record_incident(
                    account,
                    net,
                    &format!("staked in {txid} but the pool credit failed: {e}"),
                    now,
                );
            }
        }
        tracing::info!(account = %account, amount = %amount, ?mode, "staked");
        Ok(outcome)
    }

    /// Pool mode schedules a delayed payout; individual mode sweeps the
    /// account's staking outputs back to its native address now.
    pub fn request_unstake(
        &self,
        account: AccountId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<UnstakeOutcome> {
        let amount = self.require_above_minimal(amount)?;
        let destination = self.addresses.deposit_address(account, WalletKind::Native)?;

        match self.ledger.account(account)?.staking_mode {
            StakingMode::Pool => {
                let draft = TaskDraft::new(account, amount, TaskPayload::Unstake { destination }, now)
                    .eligible_at(now + random_delay(self.config.unstake_delay_hours));
                let (tasks, ()) = self.tasks.enqueue_with(vec![draft], |pending, _| {
                    let staked = self.ledger.balance(account, Bucket::StakingPool)?;
                    let available = staked - pending.pending_total(account, TaskKind::Unstake);
                    if available < amount {
                        return Err(CoinledgerError::InsufficientFunds {
                            account,
                            bucket: Bucket::StakingPool,
                            needed: amount,
                            available,
                        });
                    }
                    Ok(())
                })?;
                let task = &tasks[0];
                tracing::info!(account = %account, task = %task.id, amount = %amount, "unstake scheduled");
                Ok(UnstakeOutcome::Scheduled(TaskScheduled {
                    task: task.id,
                    amount,
                    eligible_at: task.eligible_at,
                }))
            }
            StakingMode::Individual => {
                let (own, outputs) = self.staking_outputs(account)?;
                let total: Decimal = outputs.iter().map(|u| u.amount).sum();
                if total < amount {
                    return Err(CoinledgerError::InsufficientFunds {
                        account,
                        bucket: Bucket::StakingPool,
                        needed: amount,
                        available: total,
                    });
                }
                let wallet = self.wallet(WalletKind::Staking);
                let inputs: Vec<_> = outputs.into_iter().map(|u| u.outpoint).collect();
                let tx = build_signed(
                    wallet,
                    &self.config,
                    &inputs,
                    total,
                    &destination,
                    amount,
                    &own,
                    FeePayer::Recipient,
                )?;
                match broadcast(wallet, &tx)? {
                    Broadcast::Sent(sent) => {
                        tracing::info!(account = %account, txid = %sent.txid, amount = %sent.delivered, "staking outputs swept");
                        Ok(UnstakeOutcome::Swept {
                            txid: sent.txid,
                            amount: sent.delivered,
                        })
                    }
                    Broadcast::InputsSpent { code } => Err(CoinledgerError::AmbiguousInputsSpent { code }),
                    Broadcast::Ambiguous { reason } => {
                        self.tasks.record_incident(account, amount, &reason, now);
                        Err(CoinledgerError::ExternalUnavailable {
                            service: "staking".into(),
                            reason,
                        })
                    }
                }
            }
        }
    }

    /// Switch between pool and individual staking. Refused while anything
    /// is staked or an unstake is in flight.
    pub fn set_staking_mode(&self, account: AccountId, mode: StakingMode) -> Result<()> {
        let current = self.ledger.account(account)?.staking_mode;
        if current == mode {
            return Ok(());
        }
        let staked = self.staking_balance(account)?;
        let unstaking = self.tasks.pending_total(account, TaskKind::Unstake);
        let pooled = self.ledger.balance(account, Bucket::StakingPool)?;
        if !staked.is_zero() || !unstaking.is_zero() || !pooled.is_zero() {
            return Err(CoinledgerError::invalid(
                "cannot switch staking mode while coins are staked or unstaking",
            ));
        }
        self.ledger.set_staking_mode(account, mode)?;
        tracing::info!(account = %account, ?mode, "staking mode changed");
        Ok(())
    }

    // =================================================================
    // Masternode investment
    // =================================================================

    /// Queue an investment into the shared masternodes. One pending request
    /// per account; the native debit happens now.
    pub fn request_masternode_invest(
        &self,
        account: AccountId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TaskScheduled> {
        let amount = self.require_above_minimal(amount)?;
        let amount_without_fee = amount - self.config.transaction_commission;
        let draft = TaskDraft::new(
            account,
            amount,
            TaskPayload::MasternodeInvest { amount_without_fee },
            now,
        );
        let (tasks, ()) = self.tasks.enqueue_with(vec![draft], |pending, ids| {
            if pending.has_pending(account, TaskKind::MasternodeInvest) {
                return Err(CoinledgerError::PendingRequestExists {
                    account,
                    kind: TaskKind::MasternodeInvest.to_string(),
                });
            }
            let invested = self.ledger.balance(account, Bucket::Masternode)?;
            if invested < self.config.small_investor_balance && amount < self.config.min_first_investment {
                return Err(CoinledgerError::invalid(format!(
                    "minimal investment is {}",
                    self.config.min_first_investment
                )));
            }
            self.ledger.batch(&[account], |b| {
                b.set_reference(ids[0].to_string());
                b.debit(account, Bucket::Native, amount, OpTag::InvestRequest)
            })
        })?;
        let task = &tasks[0];
        tracing::info!(account = %account, task = %task.id, amount = %amount, "investment queued");
        Ok(TaskScheduled {
            task: task.id,
            amount,
            eligible_at: task.eligible_at,
        })
    }

    /// Debit the invested balance now and pay it out to the account's
    /// native address after a random delay.
    pub fn request_masternode_withdraw(
        &self,
        account: AccountId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TaskScheduled> {
        let amount = self.require_above_minimal(amount)?;
        let destination = self.addresses.deposit_address(account, WalletKind::Native)?;
        let draft = TaskDraft::new(
            account,
            amount,
            TaskPayload::MasternodeWithdraw { destination },
            now,
        )
        .eligible_at(now + random_delay(self.config.mn_withdraw_delay_hours));
        let (tasks, ()) = self.tasks.enqueue_with(vec![draft], |_, ids| {
            self.ledger.batch(&[account], |b| {
                b.set_reference(ids[0].to_string());
                b.debit(
                    account,
                    Bucket::Masternode,
                    amount,
                    OpTag::MasternodeWithdrawRequest,
                )
            })
        })?;
        let task = &tasks[0];
        tracing::info!(account = %account, task = %task.id, amount = %amount, "masternode withdrawal scheduled");
        Ok(TaskScheduled {
            task: task.id,
            amount,
            eligible_at: task.eligible_at,
        })
    }

    // =================================================================
    // Rewards
    // =================================================================

    /// Split `amount` equally among `recipients`. The payer is debited
    /// `share × n` into escrow now; each share is a task paid by the
    /// rewards drain.
    pub fn rain(
        &self,
        payer: AccountId,
        recipients: &[AccountId],
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<RainOutcome> {
        let amount = require_positive("amount", amount)?;
        let mut recipients = recipients.to_vec();
        recipients.sort_unstable();
        recipients.dedup();
        if recipients.is_empty() {
            return Err(CoinledgerError::invalid("rain needs at least one recipient"));
        }
        if let Some(system) = recipients.iter().find(|r| r.is_system()) {
            return Err(CoinledgerError::invalid(format!("{system} cannot receive rain")));
        }
        let count = Decimal::from(recipients.len());
        let share = truncate(amount / count);
        if share.is_zero() {
            return Err(CoinledgerError::invalid(format!(
                "{amount} is too small to split among {} recipients",
                recipients.len()
            )));
        }
        let total = share * count;
        for r in &recipients {
            self.ledger.open_account(*r);
        }

        let drafts = recipients
            .iter()
            .map(|r| TaskDraft::new(*r, share, TaskPayload::Rain, now))
            .collect();
        let (tasks, ()) = self.tasks.enqueue_with(drafts, |_, ids| {
            self.ledger.batch(&[payer, AccountId::ESCROW], |b| {
                b.set_reference(format!("rain:{}", ids[0]));
                b.transfer(payer, AccountId::ESCROW, Bucket::Native, total, OpTag::RainEscrow)
            })
        })?;
        tracing::info!(payer = %payer, recipients = tasks.len(), share = %share, "rain queued");
        Ok(RainOutcome {
            tasks: tasks.iter().map(|t| t.id).collect(),
            share,
            total,
        })
    }

    /// Queue feeder-funded airdrops. Nothing is debited now.
    pub fn enqueue_airdrop(
        &self,
        grants: &[(AccountId, Decimal)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        for (account, amount) in grants {
            require_positive("amount", *amount)?;
            if account.is_system() {
                return Err(CoinledgerError::invalid(format!("{account} cannot receive an airdrop")));
            }
        }
        for (account, _) in grants {
            self.ledger.open_account(*account);
        }
        let drafts = grants
            .iter()
            .map(|(account, amount)| TaskDraft::new(*account, *amount, TaskPayload::Airdrop, now))
            .collect();
        let (tasks, ()) = self.tasks.enqueue_with(drafts, |_, _| Ok(()))?;
        Ok(tasks.iter().map(|t| t.id).collect())
    }

    /// Escrow `amount` now and pay it to up to `max_recipients` randomly
    /// chosen participants at `execute_at`.
    pub fn create_group_payout(
        &self,
        payer: AccountId,
        amount: Decimal,
        max_recipients: usize,
        execute_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TaskScheduled> {
        let amount = require_positive("amount", amount)?;
        if max_recipients == 0 {
            return Err(CoinledgerError::invalid("max_recipients must be at least 1"));
        }
        let draft = TaskDraft::new(
            payer,
            amount,
            TaskPayload::GroupPayout {
                participants: Vec::new(),
                max_recipients,
            },
            now,
        )
        .eligible_at(execute_at.max(now));
        let (tasks, ()) = self.tasks.enqueue_with(vec![draft], |_, ids| {
            self.ledger.batch(&[payer, AccountId::ESCROW], |b| {
                b.set_reference(ids[0].to_string());
                b.transfer(
                    payer,
                    AccountId::ESCROW,
                    Bucket::Native,
                    amount,
                    OpTag::GroupPayoutEscrow,
                )
            })
        })?;
        let task = &tasks[0];
        tracing::info!(payer = %payer, task = %task.id, amount = %amount, "group payout created");
        Ok(TaskScheduled {
            task: task.id,
            amount,
            eligible_at: task.eligible_at,
        })
    }

    /// Register `account` for a pending group payout.
    pub fn join_group_payout(&self, id: TaskId, account: AccountId) -> Result<()> {
        if account.is_system() {
            return Err(CoinledgerError::invalid(format!("{account} cannot join a payout")));
        }
        self.ledger.open_account(account);
        self.tasks.update_payload(id, |payload| {
            let TaskPayload::GroupPayout { participants, .. } = payload else {
                return Err(CoinledgerError::invalid(format!("{id} is not a group payout")));
            };
            if participants.contains(&account) {
                return Err(CoinledgerError::invalid(format!("{account} already joined {id}")));
            }
            participants.push(account);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_in_window() {
        for _ in 0..50 {
            let d = random_delay((2, 6));
            assert!(d >= Duration::hours(2) && d <= Duration::hours(6));
        }
        assert_eq!(random_delay((3, 3)), Duration::hours(3));
    }
}
