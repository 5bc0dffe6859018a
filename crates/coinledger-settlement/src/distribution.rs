//! Reward distribution from the masternode and staking-pool wallets.
//!
//! Each scan asks the wallet for rewards generated since the last cursor and
//! credits every member its proportional share in one batch. The batch
//! carries the new cursor as its audit reference, so the last distributed
//! cursor can always be read back from the audit log.

use std::collections::HashMap;

use coinledger_types::{
    AccountId, Bucket, CoinledgerError, DrainReport, OpTag, Result, RewardScan, StakingMode,
    TaskKind, WalletKind, amount::pro_rata,
};
use rust_decimal::Decimal;

use crate::pipeline::Pipeline;

fn reference_prefix(kind: WalletKind) -> &'static str {
    match kind {
        WalletKind::StakingPool => "pool-reward:",
        _ => "mn-reward:",
    }
}

impl Pipeline {
    fn load_cursors(&self) -> Result<HashMap<WalletKind, String>> {
        let mut cursors = HashMap::new();
        for entry in self.ledger.audit_entries()? {
            if entry.op != OpTag::Reward {
                continue;
            }
            let Some(reference) = entry.reference else {
                continue;
            };
            for kind in [WalletKind::Masternode, WalletKind::StakingPool] {
                if let Some(cursor) = reference.strip_prefix(reference_prefix(kind)) {
                    cursors.insert(kind, cursor.to_string());
                }
            }
        }
        Ok(cursors)
    }

    fn cursors(&self) -> Result<std::sync::MutexGuard<'_, Option<HashMap<WalletKind, String>>>> {
        let mut guard = self
            .cursors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load_cursors()?);
        }
        Ok(guard)
    }

    /// Rewards on `kind` since the last distributed cursor.
    fn scan_rewards(&self, kind: WalletKind) -> Result<RewardScan> {
        let previous = self.cursors()?.as_ref().and_then(|c| c.get(&kind).cloned());
        let mut scan = self
            .wallet(kind)
            .rewards_since(previous.as_deref())
            .map_err(|e| CoinledgerError::from_gateway(&kind.to_string(), e))?;
        if scan.cursor.is_none() {
            scan.cursor = previous;
        }
        Ok(scan)
    }

    fn remember_cursor(&self, kind: WalletKind, cursor: Option<String>) -> Result<()> {
        if let Some(cursor) = cursor {
            self.cursors()?.get_or_insert_with(HashMap::new).insert(kind, cursor);
        }
        Ok(())
    }

    /// Credit `shares` to `bucket` in one batch tagged with the cursor.
    fn credit_rewards(
        &self,
        kind: WalletKind,
        bucket: Bucket,
        shares: &[(AccountId, Decimal)],
        cursor: Option<&str>,
    ) -> Result<usize> {
        if shares.is_empty() {
            return Ok(0);
        }
        let ids: Vec<AccountId> = shares.iter().map(|(id, _)| *id).collect();
        self.ledger.batch(&ids, |b| {
            b.set_reference(format!("{}{}", reference_prefix(kind), cursor.unwrap_or_default()));
            let mut credited = 0;
            for (id, share) in shares {
                if share.is_zero() {
                    continue;
                }
                b.credit(*id, bucket, *share, OpTag::Reward)?;
                credited += 1;
            }
            Ok(credited)
        })
    }

    // =================================================================
    // Masternode rewards
    // =================================================================

    /// Share new masternode rewards by invested balance over the
    /// collateralized part of the wallet.
    pub(crate) fn distribute_masternode_rewards(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let price = self.unit_price()?;
        let balance = self
            .wallet(WalletKind::Masternode)
            .get_balance()
            .map_err(|e| CoinledgerError::from_gateway("masternode", e))?;
        let collateralized = (balance / price).floor() * price;
        if collateralized.is_zero() {
            return Ok(report);
        }

        let scan = self.scan_rewards(WalletKind::Masternode)?;
        if scan.total <= Decimal::ZERO {
            self.remember_cursor(WalletKind::Masternode, scan.cursor)?;
            return Ok(report);
        }

        let shares: Vec<(AccountId, Decimal)> = self
            .ledger
            .accounts()?
            .into_iter()
            .filter(|a| a.balances.masternode > Decimal::ZERO)
            .map(|a| (a.id, pro_rata(scan.total, a.balances.masternode, collateralized)))
            .collect();
        report.examined = shares.len();
        report.completed = self.credit_rewards(
            WalletKind::Masternode,
            Bucket::Masternode,
            &shares,
            scan.cursor.as_deref(),
        )?;
        self.remember_cursor(WalletKind::Masternode, scan.cursor)?;
        tracing::info!(total = %scan.total, members = report.completed, "masternode rewards distributed");
        Ok(report)
    }

    // =================================================================
    // Staking-pool rewards
    // =================================================================

    /// Share new pool rewards among members with no unstake in flight.
    pub(crate) fn distribute_staking_pool_rewards(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let scan = self.scan_rewards(WalletKind::StakingPool)?;
        if scan.total <= Decimal::ZERO {
            self.remember_cursor(WalletKind::StakingPool, scan.cursor)?;
            return Ok(report);
        }

        let members: Vec<(AccountId, Decimal)> = self
            .ledger
            .accounts()?
            .into_iter()
            .filter(|a| a.staking_mode == StakingMode::Pool && a.balances.staking_pool > Decimal::ZERO)
            .filter(|a| !self.tasks.has_pending(a.id, TaskKind::Unstake))
            .map(|a| (a.id, a.balances.staking_pool))
            .collect();
        let pool: Decimal = members.iter().map(|(_, staked)| *staked).sum();
        if pool.is_zero() {
            tracing::warn!(total = %scan.total, "pool rewards found but no eligible members");
            return Ok(report);
        }

        let shares: Vec<(AccountId, Decimal)> = members
            .into_iter()
            .map(|(id, staked)| (id, pro_rata(scan.total, staked, pool)))
            .collect();
        report.examined = shares.len();
        report.completed = self.credit_rewards(
            WalletKind::StakingPool,
            Bucket::StakingPool,
            &shares,
            scan.cursor.as_deref(),
        )?;
        self.remember_cursor(WalletKind::StakingPool, scan.cursor)?;
        tracing::info!(total = %scan.total, members = report.completed, "staking pool rewards distributed");
        Ok(report)
    }
}
