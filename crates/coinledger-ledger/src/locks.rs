//! Bounded-wait acquisition of per-account locks.
//!
//! Locks are always taken in ascending [`AccountId`] order. Two callers that
//! need overlapping account sets therefore queue on the lowest shared id
//! instead of forming a cycle.

use std::{
    sync::{Arc, Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

use coinledger_types::{Account, AccountId, CoinledgerError, Result};

/// Shared handle to one account row.
pub type AccountCell = Arc<Mutex<Account>>;

/// Sort and deduplicate an id set into lock-acquisition order.
#[must_use]
pub fn lock_order(ids: &[AccountId]) -> Vec<AccountId> {
    let mut ordered = ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

/// Lock one cell, spinning with short sleeps until `deadline`.
///
/// A poisoned lock is recovered: balances are only written after the audit
/// append succeeded, so a panicking holder never leaves a half-applied row.
pub fn lock_until<'a>(
    id: AccountId,
    cell: &'a Mutex<Account>,
    deadline: Instant,
) -> Result<MutexGuard<'a, Account>> {
    loop {
        match cell.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(p)) => return Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    tracing::warn!(account = %id, "lock wait exceeded");
                    return Err(CoinledgerError::LockTimeout(id));
                }
                thread::sleep(Duration::from_micros(200));
            }
        }
    }
}

/// Lock every cell in order. `cells` must already be in [`lock_order`].
///
/// On timeout, every guard taken so far is dropped before returning.
pub fn lock_all<'a>(
    cells: &'a [(AccountId, AccountCell)],
    wait: Duration,
) -> Result<Vec<MutexGuard<'a, Account>>> {
    let deadline = Instant::now() + wait;
    let mut guards = Vec::with_capacity(cells.len());
    for (id, cell) in cells {
        guards.push(lock_until(*id, cell, deadline)?);
    }
    Ok(guards)
}
