//! In-memory stand-ins for the wallet daemon and node-management service.
//!
//! Only compiled with the `test-helpers` feature (or in this crate's tests).
//! The mock wallet keeps a real UTXO set: broadcasts consume inputs, create
//! outputs, and fail with `InputsSpent` when an input is already gone.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use rust_decimal::Decimal;

use crate::gateway::{
    GatewayError, GatewayResult, NodeService, OutPoint, Received, RewardScan, Utxo, WalletGateway,
    WalletKind,
};

/// A transaction the mock wallet accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTx {
    pub txid: String,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<(String, Decimal)>,
}

/// What a scripted broadcast failure does to the UTXO set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Fail before anything happens.
    Before(GatewayError),
    /// Apply the transaction, then report a timeout.
    TimeoutAfterApply,
}

#[derive(Debug, Clone)]
struct Coin {
    amount: Decimal,
    address: Option<String>,
    confirmations: u32,
}

#[derive(Debug, Default)]
struct WalletState {
    coins: BTreeMap<OutPoint, Coin>,
    locked: BTreeSet<OutPoint>,
    own_addresses: BTreeSet<String>,
    received: BTreeMap<String, (Decimal, u32)>,
    drafts: Vec<(Vec<OutPoint>, Vec<(String, Decimal)>)>,
    signed: HashMap<String, usize>,
    sent: Vec<SentTx>,
    send_failures: VecDeque<SendFailure>,
    unlock_failures: usize,
    unavailable: bool,
    fee_rate: Decimal,
    signed_size: usize,
    collateral_unit: Option<Decimal>,
    started: Vec<String>,
    block: u64,
    blocks_per_poll: u64,
    block_hashes: BTreeMap<u64, String>,
    reward_scans: VecDeque<RewardScan>,
    next_id: u64,
}

/// Scriptable in-memory wallet daemon.
#[derive(Debug)]
pub struct MockWallet {
    kind: WalletKind,
    state: Mutex<WalletState>,
}

impl MockWallet {
    #[must_use]
    pub fn new(kind: WalletKind) -> Self {
        Self {
            kind,
            state: Mutex::new(WalletState {
                fee_rate: Decimal::new(1, 4),
                signed_size: 300,
                blocks_per_poll: 1,
                block: 100,
                ..WalletState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_txid(state: &mut WalletState) -> String {
        state.next_id += 1;
        format!("{:064x}", state.next_id)
    }

    /// Add a confirmed output owned by this wallet; returns its outpoint.
    pub fn fund(&self, amount: Decimal) -> OutPoint {
        self.fund_with(amount, None, 100)
    }

    pub fn fund_with(&self, amount: Decimal, address: Option<&str>, confirmations: u32) -> OutPoint {
        let mut s = self.state();
        let op = OutPoint::new(Self::fresh_txid(&mut s), 0);
        s.coins.insert(
            op.clone(),
            Coin {
                amount,
                address: address.map(str::to_string),
                confirmations,
            },
        );
        op
    }

    /// Record `amount` received by `address` at `confirmations`.
    pub fn receive(&self, address: &str, amount: Decimal, confirmations: u32) {
        let mut s = self.state();
        let entry = s
            .received
            .entry(address.to_string())
            .or_insert((Decimal::ZERO, confirmations));
        entry.0 += amount;
        entry.1 = confirmations;
    }

    pub fn set_fee_rate(&self, rate: Decimal) {
        self.state().fee_rate = rate;
    }

    pub fn set_signed_size(&self, bytes: usize) {
        self.state().signed_size = bytes;
    }

    pub fn set_collateral_unit(&self, unit: Decimal) {
        self.state().collateral_unit = Some(unit);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn fail_next_send(&self, failure: SendFailure) {
        self.state().send_failures.push_back(failure);
    }

    /// Make the next `unlock_unspent` call fail without unlocking anything.
    pub fn fail_next_unlock(&self) {
        self.state().unlock_failures += 1;
    }

    /// Script the hash returned for `height`. Unscripted heights hash to the
    /// height itself, zero padded.
    pub fn set_block_hash(&self, height: u64, hash: &str) {
        self.state().block_hashes.insert(height, hash.to_string());
    }

    /// Jump the chain tip. The next `block_count` call reports `height + blocks_per_poll`.
    pub fn set_height(&self, height: u64) {
        self.state().block = height;
    }

    /// Blocks the chain advances on every `block_count` call.
    pub fn set_blocks_per_poll(&self, blocks: u64) {
        self.state().blocks_per_poll = blocks;
    }

    pub fn push_rewards(&self, total: Decimal, cursor: &str) {
        self.state().reward_scans.push_back(RewardScan {
            total,
            cursor: Some(cursor.to_string()),
        });
    }

    /// Remove an output behind the ledger's back (spent elsewhere).
    pub fn spend_externally(&self, output: &OutPoint) {
        let mut s = self.state();
        s.coins.remove(output);
        s.locked.remove(output);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    #[must_use]
    pub fn locked(&self) -> Vec<OutPoint> {
        self.state().locked.iter().cloned().collect()
    }

    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    #[must_use]
    pub fn coin_count(&self) -> usize {
        self.state().coins.len()
    }

    fn check(&self) -> GatewayResult<MutexGuard<'_, WalletState>> {
        let s = self.state();
        if s.unavailable {
            return Err(GatewayError::Unavailable(format!("{} wallet offline", self.kind)));
        }
        Ok(s)
    }

    fn apply(state: &mut WalletState, inputs: &[OutPoint], outputs: &[(String, Decimal)]) -> String {
        let txid = Self::fresh_txid(state);
        for input in inputs {
            state.coins.remove(input);
            state.locked.remove(input);
        }
        for (vout, (address, amount)) in (0u32..).zip(outputs) {
            if state.own_addresses.contains(address) {
                state.coins.insert(
                    OutPoint::new(txid.clone(), vout),
                    Coin {
                        amount: *amount,
                        address: Some(address.clone()),
                        confirmations: 0,
                    },
                );
            }
        }
        state.sent.push(SentTx {
            txid: txid.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        txid
    }
}

impl WalletGateway for MockWallet {
    fn kind(&self) -> WalletKind {
        self.kind
    }

    fn list_unspent(&self, min_confirmations: u32) -> GatewayResult<Vec<Utxo>> {
        let s = self.check()?;
        Ok(s.coins
            .iter()
            .filter(|(op, c)| !s.locked.contains(*op) && c.confirmations >= min_confirmations)
            .map(|(op, c)| Utxo {
                outpoint: op.clone(),
                amount: c.amount,
                address: c.address.clone(),
            })
            .collect())
    }

    fn list_lock_unspent(&self) -> GatewayResult<Vec<OutPoint>> {
        Ok(self.check()?.locked.iter().cloned().collect())
    }

    fn lock_unspent(&self, outputs: &[OutPoint]) -> GatewayResult<()> {
        let mut s = self.check()?;
        for op in outputs {
            if s.coins.contains_key(op) {
                s.locked.insert(op.clone());
            }
        }
        Ok(())
    }

    fn unlock_unspent(&self, outputs: &[OutPoint]) -> GatewayResult<()> {
        let mut s = self.check()?;
        if s.unlock_failures > 0 {
            s.unlock_failures -= 1;
            return Err(GatewayError::Rejected {
                code: -8,
                message: "unlock refused".into(),
            });
        }
        for op in outputs {
            s.locked.remove(op);
        }
        Ok(())
    }

    fn output_amount(&self, output: &OutPoint) -> GatewayResult<Decimal> {
        let s = self.check()?;
        s.coins
            .get(output)
            .map(|c| c.amount)
            .ok_or_else(|| GatewayError::Rejected {
                code: -5,
                message: format!("no such output {output}"),
            })
    }

    fn create_address(&self, label: &str) -> GatewayResult<String> {
        let mut s = self.check()?;
        s.next_id += 1;
        let address = format!("{}-{label}-{}", self.kind, s.next_id);
        s.own_addresses.insert(address.clone());
        Ok(address)
    }

    fn validate_address(&self, address: &str) -> GatewayResult<bool> {
        self.check()?;
        Ok(!address.is_empty() && !address.starts_with("bad"))
    }

    fn estimate_fee(&self, _target_confirmations: u32) -> GatewayResult<Decimal> {
        Ok(self.check()?.fee_rate)
    }

    fn create_raw_transaction(
        &self,
        inputs: &[OutPoint],
        outputs: &[(String, Decimal)],
    ) -> GatewayResult<String> {
        let mut s = self.check()?;
        if outputs.iter().any(|(_, a)| *a <= Decimal::ZERO) {
            return Err(GatewayError::Rejected {
                code: -3,
                message: "invalid amount".into(),
            });
        }
        s.drafts.push((inputs.to_vec(), outputs.to_vec()));
        Ok(format!("raw:{}", s.drafts.len() - 1))
    }

    fn sign_raw_transaction(&self, hex: &str) -> GatewayResult<String> {
        let mut s = self.check()?;
        let draft: usize = hex
            .strip_prefix("raw:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| GatewayError::Rejected {
                code: -22,
                message: "TX decode failed".into(),
            })?;
        let width = s.signed_size * 2;
        let digits = format!("{draft:x}");
        let signed = "0".repeat(width.saturating_sub(digits.len())) + &digits;
        s.signed.insert(signed.clone(), draft);
        Ok(signed)
    }

    fn send_raw_transaction(&self, hex: &str) -> GatewayResult<String> {
        let mut s = self.check()?;
        let draft = *s.signed.get(hex).ok_or_else(|| GatewayError::Rejected {
            code: -22,
            message: "TX decode failed".into(),
        })?;
        let (inputs, outputs) = s.drafts[draft].clone();
        match s.send_failures.pop_front() {
            Some(SendFailure::Before(err)) => return Err(err),
            Some(SendFailure::TimeoutAfterApply) => {
                Self::apply(&mut s, &inputs, &outputs);
                return Err(GatewayError::Timeout);
            }
            None => {}
        }
        if inputs.iter().any(|i| !s.coins.contains_key(i)) {
            return Err(GatewayError::InputsSpent { code: -26 });
        }
        Ok(Self::apply(&mut s, &inputs, &outputs))
    }

    fn get_balance(&self) -> GatewayResult<Decimal> {
        Ok(self.check()?.coins.values().map(|c| c.amount).sum())
    }

    fn list_received_by_address(&self, min_confirmations: u32) -> GatewayResult<Vec<Received>> {
        let s = self.check()?;
        Ok(s.received
            .iter()
            .filter(|(_, (_, conf))| *conf >= min_confirmations)
            .map(|(address, (amount, _))| Received {
                address: address.clone(),
                amount: *amount,
            })
            .collect())
    }

    fn block_count(&self) -> GatewayResult<u64> {
        let mut s = self.check()?;
        s.block += s.blocks_per_poll;
        Ok(s.block)
    }

    fn block_hash(&self, height: u64) -> GatewayResult<String> {
        let s = self.check()?;
        if height > s.block {
            return Err(GatewayError::from_rpc(-8, "Block height out of range"));
        }
        Ok(s.block_hashes
            .get(&height)
            .cloned()
            .unwrap_or_else(|| format!("{height:064x}")))
    }

    fn rewards_since(&self, _cursor: Option<&str>) -> GatewayResult<RewardScan> {
        Ok(self.check()?.reward_scans.pop_front().unwrap_or_default())
    }

    fn masternode_outputs(&self) -> GatewayResult<Vec<OutPoint>> {
        let s = self.check()?;
        let Some(unit) = s.collateral_unit else {
            return Ok(Vec::new());
        };
        Ok(s.coins
            .iter()
            .filter(|(_, c)| c.amount == unit)
            .map(|(op, _)| op.clone())
            .collect())
    }

    fn list_masternodes(&self) -> GatewayResult<Vec<String>> {
        Ok(self.check()?.started.clone())
    }

    fn start_masternode(&self, alias: &str) -> GatewayResult<String> {
        let mut s = self.check()?;
        s.started.push(alias.to_string());
        Ok(format!("Masternode {alias} started"))
    }
}

/// Scriptable node-management service. Answers `OK` unless told otherwise.
#[derive(Debug, Default)]
pub struct MockNodeService {
    state: Mutex<NodeState>,
}

#[derive(Debug, Default)]
struct NodeState {
    configs: Vec<String>,
    reloads: usize,
    config_replies: VecDeque<String>,
    reload_replies: VecDeque<String>,
}

impl MockNodeService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reply_to_next_config(&self, body: &str) {
        self.state().config_replies.push_back(body.to_string());
    }

    pub fn reply_to_next_reload(&self, body: &str) {
        self.state().reload_replies.push_back(body.to_string());
    }

    #[must_use]
    pub fn configs(&self) -> Vec<String> {
        self.state().configs.clone()
    }

    #[must_use]
    pub fn reloads(&self) -> usize {
        self.state().reloads
    }
}

impl NodeService for MockNodeService {
    fn post_config(&self, content: &str) -> GatewayResult<String> {
        let mut s = self.state();
        s.configs.push(content.to_string());
        Ok(s.config_replies.pop_front().unwrap_or_else(|| "OK".to_string()))
    }

    fn reload(&self) -> GatewayResult<String> {
        let mut s = self.state();
        s.reloads += 1;
        Ok(s.reload_replies.pop_front().unwrap_or_else(|| "OK".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: i64) -> Decimal {
        Decimal::from(n)
    }

    #[test]
    fn broadcast_consumes_inputs_and_keeps_change() {
        let w = MockWallet::new(WalletKind::Native);
        let op = w.fund(d(10));
        let change = w.create_address("change").unwrap();
        let raw = w
            .create_raw_transaction(&[op.clone()], &[("dest".into(), d(4)), (change, d(6))])
            .unwrap();
        let signed = w.sign_raw_transaction(&raw).unwrap();
        assert_eq!(signed.len(), 600);
        w.send_raw_transaction(&signed).unwrap();
        assert_eq!(w.get_balance().unwrap(), d(6));

        // replaying the same transaction finds its input gone
        let err = w.send_raw_transaction(&signed).unwrap_err();
        assert_eq!(err, GatewayError::InputsSpent { code: -26 });
    }

    #[test]
    fn locked_outputs_hidden_from_list_unspent() {
        let w = MockWallet::new(WalletKind::Masternode);
        let a = w.fund(d(1));
        w.fund(d(2));
        w.lock_unspent(&[a.clone()]).unwrap();
        assert_eq!(w.list_unspent(0).unwrap().len(), 1);
        assert_eq!(w.list_lock_unspent().unwrap(), vec![a.clone()]);
        w.fail_next_unlock();
        assert!(w.unlock_unspent(&[a.clone()]).is_err());
        assert_eq!(w.locked(), vec![a.clone()]);
        w.unlock_unspent(&[a]).unwrap();
        assert_eq!(w.list_unspent(0).unwrap().len(), 2);
    }

    #[test]
    fn block_hashes_exist_up_to_the_tip() {
        let w = MockWallet::new(WalletKind::Native);
        w.set_height(200);
        w.set_block_hash(150, "00ff");
        assert_eq!(w.block_hash(150).unwrap(), "00ff");
        assert_eq!(w.block_hash(200).unwrap(), format!("{:064x}", 200));
        assert!(matches!(
            w.block_hash(201),
            Err(GatewayError::Rejected { code: -8, .. })
        ));
        w.set_blocks_per_poll(5);
        assert_eq!(w.block_count().unwrap(), 205);
    }

    #[test]
    fn unavailable_wallet_errors() {
        let w = MockWallet::new(WalletKind::Bitcoin);
        w.set_unavailable(true);
        assert!(matches!(w.get_balance(), Err(GatewayError::Unavailable(_))));
    }

    #[test]
    fn node_service_scripted_replies() {
        let n = MockNodeService::new();
        n.reply_to_next_reload("FAIL");
        assert_eq!(n.post_config("cfg").unwrap(), "OK");
        assert_eq!(n.reload().unwrap(), "FAIL");
        assert_eq!(n.reload().unwrap(), "OK");
        assert_eq!(n.configs(), vec!["cfg".to_string()]);
        assert_eq!(n.reloads(), 2);
    }
}
