//! The ledger: sole owner of every balance field.
//!
//! Every read-modify-write runs inside a [`Batch`] that holds the exclusive
//! locks of all accounts it touches, taken in ascending id order with a
//! bounded wait. The batch stages its changes; on success the audit entries
//! are appended to the sink first and only then are balances written back.
//! A failing closure, an insufficient balance, or a sink error leaves every
//! account exactly as it was. Address and staking-mode changes are written
//! to the sink the same way before they touch the account.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError, RwLock},
    time::Instant,
};

use coinledger_types::{
    Account, AccountChange, AccountId, AuditEntry, Balances, Bucket, CoinledgerError, GENESIS_HASH, LedgerConfig,
    OpTag, Result, StakingMode, WalletKind, amount::require_positive, constants::AMOUNT_SCALE,
};
use rust_decimal::Decimal;

use crate::{
    audit_log::{AuditSink, MemorySink, verify_chain},
    locks::{self, AccountCell},
    supply::SupplyConservation,
};

/// A bucket whose balance disagrees with the sum of its audit deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMismatch {
    pub account: AccountId,
    pub bucket: Bucket,
    pub balance: Decimal,
    pub audit_sum: Decimal,
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Staged {
    account: AccountId,
    bucket: Bucket,
    delta: Decimal,
    balance_after: Decimal,
    op: OpTag,
    reference: Option<String>,
}

/// Staged mutations over a fixed, locked set of accounts.
#[derive(Debug)]
pub struct Batch {
    balances: BTreeMap<AccountId, Balances>,
    staged: Vec<Staged>,
    reference: Option<String>,
}

impl Batch {
    fn new(balances: BTreeMap<AccountId, Balances>) -> Self {
        Self {
            balances,
            staged: Vec::new(),
            reference: None,
        }
    }

    /// Correlation id recorded on every subsequent entry of this batch.
    pub fn set_reference(&mut self, reference: impl Into<String>) {
        self.reference = Some(reference.into());
    }

    fn slot(&mut self, account: AccountId) -> Result<&mut Balances> {
        self.balances.get_mut(&account).ok_or_else(|| {
            CoinledgerError::Internal(format!("{account} is not locked by this batch"))
        })
    }

    /// Current (staged) balance.
    pub fn balance(&self, account: AccountId, bucket: Bucket) -> Result<Decimal> {
        self.balances
            .get(&account)
            .map(|b| b.get(bucket))
            .ok_or_else(|| {
                CoinledgerError::Internal(format!("{account} is not locked by this batch"))
            })
    }

    /// Whole staged balances of one account.
    pub fn balances(&self, account: AccountId) -> Result<Balances> {
        self.balances.get(&account).copied().ok_or_else(|| {
            CoinledgerError::Internal(format!("{account} is not locked by this batch"))
        })
    }

    fn check_amount(amount: Decimal) -> Result<()> {
        if amount < Decimal::ZERO || amount.normalize().scale() > AMOUNT_SCALE {
            return Err(CoinledgerError::invalid(format!(
                "ledger amount out of range: {amount}"
            )));
        }
        Ok(())
    }

    fn push(&mut self, account: AccountId, bucket: Bucket, delta: Decimal, op: OpTag) -> Result<()> {
        let reference = self.reference.clone();
        let slot = self.slot(account)?;
        let after = slot.get(bucket) + delta;
        *slot.get_mut(bucket) = after;
        self.staged.push(Staged {
            account,
            bucket,
            delta,
            balance_after: after,
            op,
            reference,
        });
        Ok(())
    }

    /// Remove `amount` from a bucket. A zero amount is a no-op.
    ///
    /// # Errors
    /// [`CoinledgerError::InsufficientFunds`] when the bucket holds less.
    pub fn debit(&mut self, account: AccountId, bucket: Bucket, amount: Decimal, op: OpTag) -> Result<()> {
        Self::check_amount(amount)?;
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.balance(account, bucket)?;
        if available < amount {
            return Err(CoinledgerError::InsufficientFunds {
                account,
                bucket,
                needed: amount,
                available,
            });
        }
        self.push(account, bucket, -amount, op)
    }

    /// Add `amount` to a bucket. A zero amount is a no-op.
    pub fn credit(&mut self, account: AccountId, bucket: Bucket, amount: Decimal, op: OpTag) -> Result<()> {
        Self::check_amount(amount)?;
        if amount.is_zero() {
            return Ok(());
        }
        self.push(account, bucket, amount, op)
    }

    /// Debit `from` and credit `to` in the same bucket.
    pub fn transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        bucket: Bucket,
        amount: Decimal,
        op: OpTag,
    ) -> Result<()> {
        self.debit(from, bucket, amount, op)?;
        self.credit(to, bucket, amount, op)
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

struct Journal {
    sink: Box<dyn AuditSink>,
    next_seq: u64,
    last_hash: String,
    supply: SupplyConservation,
}

impl Journal {
    /// Chain, persist, then fold the staged entries. Nothing is recorded
    /// in memory unless the sink accepted the whole batch.
    fn commit(&mut self, staged: Vec<Staged>) -> Result<usize> {
        let mut prev = self.last_hash.clone();
        let mut entries = Vec::with_capacity(staged.len());
        for (seq, s) in (self.next_seq..).zip(staged) {
            let entry = AuditEntry::chained(
                seq,
                s.account,
                s.bucket,
                s.delta,
                s.balance_after,
                s.op,
                s.reference,
                prev,
            );
            prev = entry.hash.clone();
            entries.push(entry);
        }
        self.sink.append(&entries)?;
        for entry in &entries {
            self.supply.record(entry);
        }
        self.next_seq += entries.len() as u64;
        self.last_hash = prev;
        Ok(entries.len())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    config: LedgerConfig,
    accounts: RwLock<BTreeMap<AccountId, AccountCell>>,
    journal: Mutex<Journal>,
}

impl Ledger {
    /// In-memory ledger with the system accounts opened.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        let ledger = Self {
            config,
            accounts: RwLock::new(BTreeMap::new()),
            journal: Mutex::new(Journal {
                sink: Box::new(MemorySink::new()),
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
                supply: SupplyConservation::new(),
            }),
        };
        for id in AccountId::SYSTEM {
            ledger.open_account(id);
        }
        ledger
    }

    /// Ledger backed by `sink`, rebuilding balances from the entries it
    /// already holds and account metadata from its recorded changes.
    ///
    /// # Errors
    /// [`CoinledgerError::AuditChainBroken`] if the stored chain does not verify.
    pub fn with_sink(config: LedgerConfig, sink: Box<dyn AuditSink>) -> Result<Self> {
        let entries = sink.entries()?;
        verify_chain(&entries)?;

        let mut accounts: BTreeMap<AccountId, Account> = BTreeMap::new();
        let mut supply = SupplyConservation::new();
        for entry in &entries {
            let account = accounts
                .entry(entry.account)
                .or_insert_with(|| Account::new(entry.account));
            let slot = account.balances.get_mut(entry.bucket);
            if *slot + entry.delta != entry.balance_after {
                return Err(CoinledgerError::AuditChainBroken { seq: entry.seq });
            }
            *slot = entry.balance_after;
            supply.record(entry);
        }
        let changes = sink.changes()?;
        for change in &changes {
            let account = accounts
                .entry(change.account())
                .or_insert_with(|| Account::new(change.account()));
            change.apply(account);
        }
        let last_hash = entries
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
        tracing::info!(
            entries = entries.len(),
            changes = changes.len(),
            accounts = accounts.len(),
            "ledger replayed"
        );

        let ledger = Self {
            config,
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|(id, a)| (id, AccountCell::new(Mutex::new(a))))
                    .collect(),
            ),
            journal: Mutex::new(Journal {
                sink,
                next_seq: entries.len() as u64,
                last_hash,
                supply,
            }),
        };
        for id in AccountId::SYSTEM {
            ledger.open_account(id);
        }
        Ok(ledger)
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cells(&self, ordered: &[AccountId]) -> Result<Vec<(AccountId, AccountCell)>> {
        let map = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        ordered
            .iter()
            .map(|id| {
                map.get(id)
                    .map(|cell| (*id, AccountCell::clone(cell)))
                    .ok_or_else(|| CoinledgerError::not_found(format!("account {id}")))
            })
            .collect()
    }

    fn all_cells(&self) -> Vec<(AccountId, AccountCell)> {
        let map = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|(id, c)| (*id, AccountCell::clone(c))).collect()
    }

    // =================================================================
    // Accounts
    // =================================================================

    /// Create the account on first interaction. Returns `true` if created.
    pub fn open_account(&self, id: AccountId) -> bool {
        let mut map = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            return false;
        }
        map.insert(id, AccountCell::new(Mutex::new(Account::new(id))));
        tracing::debug!(account = %id, "account opened");
        true
    }

    #[must_use]
    pub fn contains(&self, id: AccountId) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    #[must_use]
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Snapshot of one account.
    pub fn account(&self, id: AccountId) -> Result<Account> {
        let cells = self.cells(&[id])?;
        let deadline = Instant::now() + self.config.lock_wait();
        let guard = locks::lock_until(id, &cells[0].1, deadline)?;
        Ok(guard.clone())
    }

    pub fn balance(&self, id: AccountId, bucket: Bucket) -> Result<Decimal> {
        Ok(self.account(id)?.balances.get(bucket))
    }

    /// Snapshot of every account, taken one lock at a time.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        let cells = self.all_cells();
        let deadline = Instant::now() + self.config.lock_wait();
        cells
            .iter()
            .map(|(id, cell)| locks::lock_until(*id, cell, deadline).map(|g| g.clone()))
            .collect()
    }

    /// Store a deposit address for `wallet`.
    pub fn set_address(&self, id: AccountId, wallet: WalletKind, address: &str) -> Result<()> {
        self.change_account(AccountChange::Address {
            account: id,
            wallet,
            address: address.to_string(),
        })
    }

    pub fn set_staking_mode(&self, id: AccountId, mode: StakingMode) -> Result<()> {
        self.change_account(AccountChange::StakingMode { account: id, mode })
    }

    /// Owner of a stored deposit address.
    pub fn find_by_address(&self, wallet: WalletKind, address: &str) -> Result<Option<AccountId>> {
        Ok(self
            .accounts()?
            .into_iter()
            .find(|a| a.address(wallet) == Some(address))
            .map(|a| a.id))
    }

    /// Persist, then apply, a change to non-balance account fields.
    fn change_account(&self, change: AccountChange) -> Result<()> {
        let id = change.account();
        let cells = self.cells(&[id])?;
        let deadline = Instant::now() + self.config.lock_wait();
        let mut guard = locks::lock_until(id, &cells[0].1, deadline)?;
        self.journal().sink.record_change(&change)?;
        change.apply(&mut guard);
        Ok(())
    }

    // =================================================================
    // Mutation
    // =================================================================

    /// Run `f` over the locked accounts `ids` and commit its staged changes
    /// atomically.
    ///
    /// # Errors
    /// Whatever `f` returns, [`CoinledgerError::NotFound`] for an unknown
    /// account, [`CoinledgerError::LockTimeout`], or a sink failure. In every
    /// error case no balance changes.
    pub fn batch<T>(&self, ids: &[AccountId], f: impl FnOnce(&mut Batch) -> Result<T>) -> Result<T> {
        let ordered = locks::lock_order(ids);
        let cells = self.cells(&ordered)?;
        let mut guards = locks::lock_all(&cells, self.config.lock_wait())?;

        let mut batch = Batch::new(guards.iter().map(|g| (g.id, g.balances)).collect());
        let value = f(&mut batch)?;
        if batch.staged.is_empty() {
            return Ok(value);
        }

        let mut journal = self.journal();
        let count = journal.commit(batch.staged)?;
        for guard in &mut guards {
            if let Some(balances) = batch.balances.get(&guard.id) {
                guard.balances = *balances;
            }
        }
        drop(journal);
        tracing::debug!(accounts = ordered.len(), entries = count, "batch committed");
        Ok(value)
    }

    /// Debit one bucket. Returns the resulting balance.
    pub fn debit(&self, id: AccountId, bucket: Bucket, amount: Decimal, op: OpTag) -> Result<Decimal> {
        require_positive("amount", amount)?;
        self.batch(&[id], |b| {
            b.debit(id, bucket, amount, op)?;
            b.balance(id, bucket)
        })
    }

    /// Credit one bucket. Returns the resulting balance.
    pub fn credit(&self, id: AccountId, bucket: Bucket, amount: Decimal, op: OpTag) -> Result<Decimal> {
        require_positive("amount", amount)?;
        self.batch(&[id], |b| {
            b.credit(id, bucket, amount, op)?;
            b.balance(id, bucket)
        })
    }

    /// Atomic debit of `from` plus credit of `to`.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        bucket: Bucket,
        amount: Decimal,
        op: OpTag,
    ) -> Result<()> {
        require_positive("amount", amount)?;
        self.batch(&[from, to], |b| b.transfer(from, to, bucket, amount, op))
    }

    // =================================================================
    // Audit & reconciliation
    // =================================================================

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        self.journal().sink.entries()
    }

    /// Re-hash the whole stored chain.
    pub fn verify_audit_chain(&self) -> Result<()> {
        verify_chain(&self.audit_entries()?)
    }

    /// Σ deltas recorded for one bucket of one account.
    pub fn audit_sum(&self, id: AccountId, bucket: Bucket) -> Result<Decimal> {
        Ok(self
            .audit_entries()?
            .iter()
            .filter(|e| e.account == id && e.bucket == bucket)
            .map(|e| e.delta)
            .sum())
    }

    /// Lock every account (in order) and the journal, then run `f` on a
    /// consistent view.
    fn with_everything<T>(
        &self,
        f: impl FnOnce(&[MutexGuard<'_, Account>], &Journal) -> Result<T>,
    ) -> Result<T> {
        let cells = self.all_cells();
        let guards = locks::lock_all(&cells, self.config.lock_wait())?;
        let journal = self.journal();
        f(&guards, &journal)
    }

    /// Buckets whose balance differs from the sum of their audit deltas.
    pub fn reconcile(&self) -> Result<Vec<BalanceMismatch>> {
        self.with_everything(|accounts, journal| {
            let mut sums: BTreeMap<(AccountId, Bucket), Decimal> = BTreeMap::new();
            for e in journal.sink.entries()? {
                *sums.entry((e.account, e.bucket)).or_default() += e.delta;
            }
            let mut out = Vec::new();
            for account in accounts {
                for bucket in Bucket::ALL {
                    let balance = account.balances.get(bucket);
                    let audit_sum = sums.get(&(account.id, bucket)).copied().unwrap_or_default();
                    if balance != audit_sum {
                        out.push(BalanceMismatch {
                            account: account.id,
                            bucket,
                            balance,
                            audit_sum,
                        });
                    }
                }
            }
            Ok(out)
        })
    }

    /// Check Σ balances + held == inflows − outflows for every bucket.
    pub fn verify_supply(&self) -> Result<()> {
        self.with_everything(|accounts, journal| {
            for bucket in Bucket::ALL {
                let actual: Decimal = accounts.iter().map(|a| a.balances.get(bucket)).sum();
                journal.supply.verify(bucket, actual)?;
            }
            Ok(())
        })
    }

    /// Copy of the running supply totals.
    #[must_use]
    pub fn supply(&self) -> SupplyConservation {
        self.journal().supply.clone()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn ledger_with(id: i64, native: i64) -> (Ledger, AccountId) {
        let ledger = Ledger::default();
        let acct = AccountId(id);
        ledger.open_account(acct);
        if native > 0 {
            ledger.credit(acct, Bucket::Native, d(native), OpTag::Deposit).unwrap();
        }
        (ledger, acct)
    }

    #[test]
    fn system_accounts_exist() {
        let ledger = Ledger::default();
        assert!(ledger.contains(AccountId::FEEDER));
        assert!(ledger.contains(AccountId::ESCROW));
        assert!(ledger.contains(AccountId::LOTTERY));
        assert!(!ledger.open_account(AccountId::FEEDER));
    }

    #[test]
    fn credit_then_debit() {
        let (ledger, a) = ledger_with(1, 100);
        assert_eq!(ledger.debit(a, Bucket::Native, d(30), OpTag::ExternalSend).unwrap(), d(70));
        assert_eq!(ledger.balance(a, Bucket::Native).unwrap(), d(70));
        assert_eq!(ledger.audit_entries().unwrap().len(), 2);
    }

    #[test]
    fn overdraft_rejected_without_change() {
        let (ledger, a) = ledger_with(1, 10);
        let err = ledger.debit(a, Bucket::Native, d(11), OpTag::ExternalSend).unwrap_err();
        assert!(matches!(err, CoinledgerError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance(a, Bucket::Native).unwrap(), d(10));
        assert_eq!(ledger.audit_entries().unwrap().len(), 1);
    }

    #[test]
    fn zero_and_negative_amounts_rejected() {
        let (ledger, a) = ledger_with(1, 10);
        assert!(matches!(
            ledger.credit(a, Bucket::Native, Decimal::ZERO, OpTag::Deposit),
            Err(CoinledgerError::InvalidArgument { .. })
        ));
        assert!(ledger.debit(a, Bucket::Native, d(-1), OpTag::Deposit).is_err());
    }

    #[test]
    fn unknown_account_is_not_found() {
        let ledger = Ledger::default();
        let err = ledger.credit(AccountId(9), Bucket::Native, d(1), OpTag::Deposit).unwrap_err();
        assert!(matches!(err, CoinledgerError::NotFound { .. }));
    }

    #[test]
    fn failed_batch_rolls_back_all_staged_changes() {
        let (ledger, a) = ledger_with(1, 10);
        let b = AccountId(2);
        ledger.open_account(b);
        let err = ledger
            .batch(&[a, b], |batch| {
                batch.transfer(a, b, Bucket::Native, d(5), OpTag::Transfer)?;
                batch.debit(a, Bucket::Bitcoin, d(1), OpTag::ExternalSend)
            })
            .unwrap_err();
        assert!(matches!(err, CoinledgerError::InsufficientFunds { bucket: Bucket::Bitcoin, .. }));
        assert_eq!(ledger.balance(a, Bucket::Native).unwrap(), d(10));
        assert_eq!(ledger.balance(b, Bucket::Native).unwrap(), d(0));
    }

    #[test]
    fn batch_cannot_touch_unlocked_account() {
        let (ledger, a) = ledger_with(1, 10);
        ledger.open_account(AccountId(2));
        let err = ledger
            .batch(&[a], |b| b.credit(AccountId(2), Bucket::Native, d(1), OpTag::Transfer))
            .unwrap_err();
        assert!(matches!(err, CoinledgerError::Internal(_)));
    }

    #[test]
    fn self_transfer_is_neutral() {
        let (ledger, a) = ledger_with(1, 10);
        ledger.transfer(a, a, Bucket::Native, d(4), OpTag::Transfer).unwrap();
        assert_eq!(ledger.balance(a, Bucket::Native).unwrap(), d(10));
    }

    #[test]
    fn audit_chain_and_sums_hold() {
        let (ledger, a) = ledger_with(1, 50);
        ledger.debit(a, Bucket::Native, d(20), OpTag::ExternalSend).unwrap();
        ledger.credit(a, Bucket::Bitcoin, d(3), OpTag::Deposit).unwrap();
        ledger.verify_audit_chain().unwrap();
        assert_eq!(ledger.audit_sum(a, Bucket::Native).unwrap(), d(30));
        assert!(ledger.reconcile().unwrap().is_empty());
        ledger.verify_supply().unwrap();
    }

    #[test]
    fn addresses_and_modes() {
        let (ledger, a) = ledger_with(1, 0);
        ledger.set_address(a, WalletKind::Native, "addr-1").unwrap();
        ledger.set_staking_mode(a, StakingMode::Individual).unwrap();
        assert_eq!(ledger.find_by_address(WalletKind::Native, "addr-1").unwrap(), Some(a));
        assert_eq!(ledger.find_by_address(WalletKind::Bitcoin, "addr-1").unwrap(), None);
        assert_eq!(ledger.account(a).unwrap().staking_mode, StakingMode::Individual);
    }

    #[test]
    fn replay_rebuilds_balances() {
        let (ledger, a) = ledger_with(1, 40);
        ledger.debit(a, Bucket::Native, d(15), OpTag::ExternalSend).unwrap();
        let mut sink = MemorySink::new();
        sink.append(&ledger.audit_entries().unwrap()).unwrap();

        let replayed = Ledger::with_sink(LedgerConfig::default(), Box::new(sink)).unwrap();
        assert_eq!(replayed.balance(a, Bucket::Native).unwrap(), d(25));
        replayed.credit(a, Bucket::Native, d(5), OpTag::Deposit).unwrap();
        replayed.verify_audit_chain().unwrap();
        replayed.verify_supply().unwrap();
    }

    #[test]
    fn replay_restores_addresses_and_modes() {
        let mut sink = MemorySink::new();
        sink.record_change(&AccountChange::Address {
            account: AccountId(3),
            wallet: WalletKind::Native,
            address: "addr-3".into(),
        })
        .unwrap();
        sink.record_change(&AccountChange::StakingMode {
            account: AccountId(3),
            mode: StakingMode::Individual,
        })
        .unwrap();

        let replayed = Ledger::with_sink(LedgerConfig::default(), Box::new(sink)).unwrap();
        let account = replayed.account(AccountId(3)).unwrap();
        assert_eq!(account.staking_mode, StakingMode::Individual);
        assert_eq!(account.address(WalletKind::Native), Some("addr-3"));
        assert!(account.balances.is_zero());
        assert_eq!(
            replayed.find_by_address(WalletKind::Native, "addr-3").unwrap(),
            Some(AccountId(3))
        );
    }

    #[test]
    fn replay_rejects_tampered_chain() {
        let (ledger, _) = ledger_with(1, 40);
        let mut entries = ledger.audit_entries().unwrap();
        entries[0].balance_after = d(41);
        let mut sink = MemorySink::new();
        sink.append(&entries).unwrap();
        assert!(matches!(
            Ledger::with_sink(LedgerConfig::default(), Box::new(sink)),
            Err(CoinledgerError::AuditChainBroken { seq: 0 })
        ));
    }
}
