//! Masternode collateral slots and their allocator.
//!
//! Allocation funds the first empty slot once the masternode wallet holds
//! more than one unit (plus margin) in unlocked outputs:
//!
//! 1. send one unit to a fresh address (fee from change) and remember the
//!    txid on the slot,
//! 2. find the resulting collateral output, activate the slot, lock it,
//! 3. push the rendered config to the node service, then reload,
//! 4. wait for the confirmation threshold and start the masternode.
//!
//! A slot with a remembered txid is never funded twice: later cycles look
//! the output up again until the daemon lists it. A refused config or
//! reload rolls the registry back, unlocks the new output and pushes the
//! previous config again. Reclaiming works the other way round:
//! lowest-weight active slots are deactivated until a pending withdrawal
//! can be covered, always keeping the highest-weight slot.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
};

use coinledger_types::{
    CoinledgerError, CollateralSlot, DrainReport, GatewayResult, OutPoint, Result, SlotId,
    WalletKind, constants::NODE_SERVICE_OK, generate_config,
};
use rust_decimal::Decimal;

use crate::{
    pipeline::Pipeline,
    transaction::{Broadcast, send_funds},
};

// ---------------------------------------------------------------------------
// SlotRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Slots {
    by_id: BTreeMap<SlotId, CollateralSlot>,
    next_id: u32,
}

/// The administratively created collateral slots.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    inner: Mutex<Slots>,
}

impl SlotRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_slots(slots: Vec<CollateralSlot>) -> Self {
        let next_id = slots.iter().map(|s| s.id.0).max().unwrap_or(0);
        Self {
            inner: Mutex::new(Slots {
                by_id: slots.into_iter().map(|s| (s.id, s)).collect(),
                next_id,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty, inactive slot.
    pub fn add_slot(&self, alias: &str, address: &str, privkey: &str, weight: u32) -> SlotId {
        let mut inner = self.inner();
        let id = SlotId(inner.next_id + 1);
        inner.next_id = id.0;
        inner
            .by_id
            .insert(id, CollateralSlot::new(id, alias, address, privkey, weight));
        id
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<CollateralSlot> {
        self.inner().by_id.values().cloned().collect()
    }

    /// Replace the whole registry (rollback).
    pub fn restore(&self, slots: Vec<CollateralSlot>) {
        self.inner().by_id = slots.into_iter().map(|s| (s.id, s)).collect();
    }

    pub fn get(&self, id: SlotId) -> Result<CollateralSlot> {
        self.inner()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| CoinledgerError::not_found(format!("collateral {id}")))
    }

    #[must_use]
    pub fn first_inactive(&self) -> Option<CollateralSlot> {
        self.inner().by_id.values().find(|s| !s.active).cloned()
    }

    /// Active slots, lowest weight first.
    #[must_use]
    pub fn active(&self) -> Vec<CollateralSlot> {
        let mut active: Vec<CollateralSlot> =
            self.inner().by_id.values().filter(|s| s.active).cloned().collect();
        active.sort_by_key(|s| (s.weight, s.id));
        active
    }

    /// Outputs backing active slots.
    #[must_use]
    pub fn collateral_outputs(&self) -> BTreeSet<OutPoint> {
        self.inner()
            .by_id
            .values()
            .filter(|s| s.active)
            .filter_map(|s| s.output.clone())
            .collect()
    }

    #[must_use]
    pub fn uses_output(&self, output: &OutPoint) -> bool {
        self.inner()
            .by_id
            .values()
            .any(|s| s.output.as_ref() == Some(output))
    }

    /// Activate `id` with `output`.
    ///
    /// # Errors
    /// [`CoinledgerError::InvalidArgument`] if another slot already holds
    /// the output or the slot is already active.
    pub fn activate(&self, id: SlotId, output: OutPoint) -> Result<()> {
        let mut inner = self.inner();
        if inner.by_id.values().any(|s| s.output.as_ref() == Some(&output)) {
            return Err(CoinledgerError::invalid(format!(
                "output {output} already backs a slot"
            )));
        }
        let slot = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoinledgerError::not_found(format!("collateral {id}")))?;
        if slot.active {
            return Err(CoinledgerError::invalid(format!("{id} is already active")));
        }
        slot.activate(output);
        Ok(())
    }

    /// Remember (or forget) the funding transaction of an inactive slot.
    pub fn set_pending(&self, id: SlotId, txid: Option<String>) -> Result<()> {
        let mut inner = self.inner();
        let slot = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoinledgerError::not_found(format!("collateral {id}")))?;
        slot.pending_txid = txid;
        Ok(())
    }

    /// Funding transactions whose collateral output is not allocated yet.
    #[must_use]
    pub fn pending_txids(&self) -> BTreeSet<String> {
        self.inner()
            .by_id
            .values()
            .filter_map(|s| s.pending_txid.clone())
            .collect()
    }

    /// Deactivate `id`, returning the output it held.
    pub fn deactivate(&self, id: SlotId) -> Result<Option<OutPoint>> {
        let mut inner = self.inner();
        let slot = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoinledgerError::not_found(format!("collateral {id}")))?;
        Ok(slot.deactivate())
    }

    /// Rendered masternode configuration file.
    #[must_use]
    pub fn config(&self) -> String {
        generate_config(self.inner().by_id.values())
    }
}

/// Outcome of trying to free collateral for a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaim {
    /// Enough free funds already; nothing was deactivated.
    Covered,
    /// These outputs were released; pay on the next cycle.
    Released(Vec<OutPoint>),
    /// Even reclaiming every eligible slot would not cover the amount.
    NotEnough,
}

impl Pipeline {
    fn node_step(&self, step: &str, reply: GatewayResult<String>) -> Result<()> {
        let body = reply.map_err(|e| CoinledgerError::from_gateway("node-service", e))?;
        if body.trim() == NODE_SERVICE_OK {
            return Ok(());
        }
        tracing::error!(step, body = %body, "node service refused");
        Err(CoinledgerError::NodeServiceRefused {
            step: step.to_string(),
            body,
        })
    }

    /// Post the current config and reload the node.
    fn push_config(&self) -> Result<()> {
        self.node_step("config", self.node.post_config(&self.slots.config()))?;
        self.node_step("reload", self.node.reload())
    }

    /// Put the registry back to `before`, then try to bring the node in line.
    fn roll_back_slots(&self, before: Vec<CollateralSlot>) {
        self.slots.restore(before);
        if let Err(e) = self.node_step("config", self.node.post_config(&self.slots.config())) {
            tracing::error!(error = %e, "restoring masternode config failed");
        }
    }

    /// Make sure every active slot's output is locked.
    pub(crate) fn relock_collateral(&self) -> Result<()> {
        let outputs: Vec<OutPoint> = self.slots.collateral_outputs().into_iter().collect();
        if outputs.is_empty() {
            return Ok(());
        }
        self.wallet(WalletKind::Masternode)
            .lock_unspent(&outputs)
            .map_err(|e| CoinledgerError::from_gateway("masternode", e))
    }

    /// Value of the cheapest locked collateral output.
    ///
    /// # Errors
    /// [`CoinledgerError::CollateralPriceUnavailable`] when none is locked.
    pub fn unit_price(&self) -> Result<Decimal> {
        let wallet = self.wallet(WalletKind::Masternode);
        let gw = |e| CoinledgerError::from_gateway("masternode", e);
        let collateral: BTreeSet<OutPoint> = wallet
            .masternode_outputs()
            .map_err(gw)?
            .into_iter()
            .chain(self.slots.collateral_outputs())
            .collect();
        let mut cheapest: Option<Decimal> = None;
        for output in wallet.list_lock_unspent().map_err(gw)? {
            if !collateral.contains(&output) {
                continue;
            }
            let amount = wallet.output_amount(&output).map_err(gw)?;
            cheapest = Some(cheapest.map_or(amount, |c| c.min(amount)));
        }
        cheapest.ok_or(CoinledgerError::CollateralPriceUnavailable)
    }

    // =================================================================
    // Allocation
    // =================================================================

    /// Fund and start the first empty slot if the wallet can afford it.
    pub(crate) fn allocate_collateral(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let Some(slot) = self.slots.first_inactive() else {
            return Ok(report);
        };
        report.examined = 1;
        let wallet = self.wallet(WalletKind::Masternode);
        let gw = |e| CoinledgerError::from_gateway("masternode", e);

        self.relock_collateral()?;
        let txid = match slot.pending_txid.clone() {
            Some(txid) => txid,
            None => match self.fund_slot(&slot, &mut report)? {
                Some(txid) => txid,
                None => return Ok(report),
            },
        };

        let Some(output) = wallet
            .masternode_outputs()
            .map_err(gw)?
            .into_iter()
            .find(|o| o.txid == txid)
        else {
            tracing::warn!(slot = %slot.id, txid = %txid, "collateral output not listed yet");
            report.deferred = 1;
            return Ok(report);
        };
        if self.slots.uses_output(&output) {
            return Err(CoinledgerError::Internal(format!(
                "collateral output {output} is already allocated"
            )));
        }

        let before = self.slots.snapshot();
        self.slots.activate(slot.id, output.clone())?;
        wallet.lock_unspent(std::slice::from_ref(&output)).map_err(gw)?;

        if let Err(e) = self.node_step("config", self.node.post_config(&self.slots.config())) {
            self.slots.restore(before);
            self.unlock_rolled_back(&output);
            return Err(e);
        }
        let start_block = wallet.block_count().map_err(gw)?;
        if let Err(e) = self.node_step("reload", self.node.reload()) {
            self.roll_back_slots(before);
            self.unlock_rolled_back(&output);
            return Err(e);
        }
        tracing::info!(slot = %slot.id, alias = %slot.alias, output = %output, "collateral allocated");

        self.start_when_confirmed(&slot.alias, start_block)?;
        report.completed = 1;
        Ok(report)
    }

    /// Send one collateral unit for `slot` and remember the txid.
    ///
    /// `None` means nothing was sent this cycle; `report` says why.
    fn fund_slot(&self, slot: &CollateralSlot, report: &mut DrainReport) -> Result<Option<String>> {
        let wallet = self.wallet(WalletKind::Masternode);
        let gw = |e| CoinledgerError::from_gateway("masternode", e);

        let price = self.unit_price()?;
        let threshold = price * self.config.collateral_margin;
        let free: Decimal = wallet.list_unspent(0).map_err(gw)?.iter().map(|u| u.amount).sum();
        if free <= threshold {
            tracing::debug!(free = %free, threshold = %threshold, "not enough free funds for collateral");
            report.deferred = 1;
            return Ok(None);
        }

        let address = wallet.create_address(&slot.alias).map_err(gw)?;
        let change = self.addresses.service_address(WalletKind::Masternode)?;
        match send_funds(wallet, &self.config, 0, &address, price, &change)? {
            Broadcast::Sent(sent) => {
                self.slots.set_pending(slot.id, Some(sent.txid.clone()))?;
                tracing::info!(slot = %slot.id, txid = %sent.txid, amount = %price, "collateral sent");
                Ok(Some(sent.txid))
            }
            Broadcast::InputsSpent { code } => {
                tracing::warn!(code, slot = %slot.id, "collateral inputs spent, retrying next cycle");
                self.relock_collateral()?;
                report.aborted = true;
                Ok(None)
            }
            Broadcast::Ambiguous { reason } => {
                tracing::error!(slot = %slot.id, reason = %reason, "collateral send ambiguous");
                report.aborted = true;
                Ok(None)
            }
        }
    }

    /// Unlock an output whose allocation was rolled back.
    fn unlock_rolled_back(&self, output: &OutPoint) {
        let wallet = self.wallet(WalletKind::Masternode);
        if let Err(e) = wallet.unlock_unspent(std::slice::from_ref(output)) {
            tracing::error!(
                output = %output,
                error = %e,
                "rolled-back collateral output is still locked"
            );
        }
    }

    /// Poll the block height until the threshold, then start the node.
    fn start_when_confirmed(&self, alias: &str, start_block: u64) -> Result<()> {
        let wallet = self.wallet(WalletKind::Masternode);
        let gw = |e| CoinledgerError::from_gateway("masternode", e);
        if wallet.list_masternodes().map_err(gw)?.iter().any(|a| a == alias) {
            tracing::info!(alias, "masternode already running");
            return Ok(());
        }
        let target = start_block + self.config.collateral_confirmations;
        for _ in 0..self.config.block_poll_limit {
            if wallet.block_count().map_err(gw)? >= target {
                let reply = wallet.start_masternode(alias).map_err(gw)?;
                tracing::info!(alias, reply = %reply, "masternode started");
                return Ok(());
            }
            thread::sleep(self.config.block_poll());
        }
        tracing::warn!(alias, target_block = target, "confirmation wait exhausted, masternode left for manual start");
        Ok(())
    }

    // =================================================================
    // Reclaim
    // =================================================================

    /// Free enough collateral to pay `amount` out of the masternode wallet.
    pub(crate) fn reclaim_collateral(&self, amount: Decimal) -> Result<Reclaim> {
        let wallet = self.wallet(WalletKind::Masternode);
        let price = self.unit_price()?;
        let active = self.slots.active();
        let balance = wallet
            .get_balance()
            .map_err(|e| CoinledgerError::from_gateway("masternode", e))?;
        let reserved = active.len() + self.slots.pending_txids().len();
        let free = balance - price * Decimal::from(reserved);
        if free >= amount {
            return Ok(Reclaim::Covered);
        }

        // The highest-weight slot always stays up.
        let candidates = &active[..active.len().saturating_sub(1)];
        if amount > free + price * Decimal::from(candidates.len()) {
            tracing::warn!(amount = %amount, free = %free, "not enough collateral to reclaim");
            return Ok(Reclaim::NotEnough);
        }

        let before = self.slots.snapshot();
        let mut released = Vec::new();
        let mut covered = free;
        for slot in candidates {
            if let Some(output) = self.slots.deactivate(slot.id)? {
                released.push(output);
            }
            covered += price;
            tracing::info!(slot = %slot.id, weight = slot.weight, "collateral reclaimed");
            if covered >= amount {
                break;
            }
        }

        if let Err(e) = self.push_config() {
            self.roll_back_slots(before);
            return Err(e);
        }
        wallet
            .unlock_unspent(&released)
            .map_err(|e| CoinledgerError::from_gateway("masternode", e))?;
        Ok(Reclaim::Released(released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_active_by_weight() {
        let reg = SlotRegistry::new();
        let a = reg.add_slot("a", "h:1", "k", 5);
        let b = reg.add_slot("b", "h:2", "k", 1);
        reg.add_slot("c", "h:3", "k", 3);
        reg.activate(a, OutPoint::new("t1", 0)).unwrap();
        reg.activate(b, OutPoint::new("t2", 0)).unwrap();
        let ids: Vec<SlotId> = reg.active().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(reg.first_inactive().unwrap().alias, "c");
    }

    #[test]
    fn one_output_never_backs_two_slots() {
        let reg = SlotRegistry::new();
        let a = reg.add_slot("a", "h:1", "k", 0);
        let b = reg.add_slot("b", "h:2", "k", 0);
        let op = OutPoint::new("t", 1);
        reg.activate(a, op.clone()).unwrap();
        assert!(reg.activate(b, op.clone()).is_err());
        assert!(reg.activate(a, OutPoint::new("u", 0)).is_err());
        assert_eq!(reg.deactivate(a).unwrap(), Some(op.clone()));
        reg.activate(b, op).unwrap();
    }

    #[test]
    fn restore_rolls_back() {
        let reg = SlotRegistry::new();
        let a = reg.add_slot("a", "h:1", "k", 0);
        let before = reg.snapshot();
        reg.activate(a, OutPoint::new("t", 0)).unwrap();
        reg.restore(before);
        let slot = reg.get(a).unwrap();
        assert!(!slot.active);
        assert!(slot.output.is_none());
        assert!(reg.config().contains("# a h:1 k None None"));
    }

    #[test]
    fn active_slots_always_carry_outputs() {
        let reg = SlotRegistry::from_slots(vec![CollateralSlot::new(SlotId(7), "x", "h", "k", 0)]);
        let id = reg.add_slot("y", "h", "k", 0);
        assert_eq!(id, SlotId(8));
        reg.activate(id, OutPoint::new("t", 0)).unwrap();
        for slot in reg.snapshot() {
            assert!(!slot.active || slot.output.is_some());
        }
    }
}
