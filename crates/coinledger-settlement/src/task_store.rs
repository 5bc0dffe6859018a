//! Deferred settlement tasks and their one-way completion flag.
//!
//! Every state change goes through the store's mutex, so a task flips to
//! `Completed` at most once no matter how many drains look at it. Work that
//! must be atomic with the flip (ledger-only payouts) runs inside
//! [`TaskStore::settle`] while the store is locked.
//!
//! Lock order: the store lock is always taken before any account lock.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use coinledger_types::{
    AccountId, CoinledgerError, Resolution, Result, SettlementTask, TaskId, TaskKind, TaskPayload,
    TaskState,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An ambiguous external outcome awaiting an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// The task involved, if the send belonged to one.
    pub task: Option<TaskId>,
    pub account: AccountId,
    pub amount: Decimal,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A task about to be created.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub owner: AccountId,
    pub amount: Decimal,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub eligible_at: DateTime<Utc>,
}

impl TaskDraft {
    /// Eligible immediately.
    #[must_use]
    pub fn new(owner: AccountId, amount: Decimal, payload: TaskPayload, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            amount,
            payload,
            created_at: now,
            eligible_at: now,
        }
    }

    #[must_use]
    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.eligible_at = at;
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<TaskId, SettlementTask>,
    next_id: u64,
    incidents: Vec<Incident>,
}

/// Read-only view of pending work, handed to enqueue closures so they can
/// check uniqueness and reservations under the store lock.
pub struct PendingTasks<'a> {
    inner: &'a Inner,
}

impl PendingTasks<'_> {
    #[must_use]
    pub fn has_pending(&self, owner: AccountId, kind: TaskKind) -> bool {
        self.inner
            .tasks
            .values()
            .any(|t| t.owner == owner && t.kind() == kind && t.is_pending())
    }

    /// Σ amounts of `owner`'s pending (or suspended) tasks of `kind`.
    #[must_use]
    pub fn pending_total(&self, owner: AccountId, kind: TaskKind) -> Decimal {
        self.inner
            .tasks
            .values()
            .filter(|t| t.owner == owner && t.kind() == kind && !t.is_completed())
            .map(|t| t.amount)
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct TaskStore {
    inner: Mutex<Inner>,
}

impl TaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot taken with [`TaskStore::snapshot`].
    #[must_use]
    pub fn from_tasks(tasks: Vec<SettlementTask>) -> Self {
        let next_id = tasks.iter().map(|t| t.id.0).max().unwrap_or(0);
        Self {
            inner: Mutex::new(Inner {
                tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
                next_id,
                incidents: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =================================================================
    // Creation
    // =================================================================

    /// Create an unfunded task.
    pub fn enqueue(&self, draft: TaskDraft) -> SettlementTask {
        let mut inner = self.inner();
        let id = TaskId(inner.next_id + 1);
        inner.next_id = id.0;
        let task = Self::materialize(id, draft);
        inner.tasks.insert(id, task.clone());
        task
    }

    /// Create `drafts` together with the ledger mutation that funds them.
    ///
    /// `fund` runs under the store lock and receives the ids the tasks will
    /// get. If it fails no task is created and no id is consumed.
    pub fn enqueue_with<T>(
        &self,
        drafts: Vec<TaskDraft>,
        fund: impl FnOnce(&PendingTasks<'_>, &[TaskId]) -> Result<T>,
    ) -> Result<(Vec<SettlementTask>, T)> {
        let mut inner = self.inner();
        let first = inner.next_id + 1;
        let ids: Vec<TaskId> = (first..).take(drafts.len()).map(TaskId).collect();
        let value = fund(&PendingTasks { inner: &inner }, &ids)?;

        let tasks: Vec<SettlementTask> = ids
            .iter()
            .zip(drafts)
            .map(|(id, draft)| Self::materialize(*id, draft))
            .collect();
        for task in &tasks {
            inner.tasks.insert(task.id, task.clone());
        }
        if let Some(last) = ids.last() {
            inner.next_id = last.0;
        }
        Ok((tasks, value))
    }

    fn materialize(id: TaskId, draft: TaskDraft) -> SettlementTask {
        SettlementTask {
            id,
            owner: draft.owner,
            amount: draft.amount,
            payload: draft.payload,
            state: TaskState::Pending,
            created_at: draft.created_at,
            eligible_at: draft.eligible_at,
            attempts: 0,
            completed_at: None,
            txid: None,
        }
    }

    // =================================================================
    // Queries
    // =================================================================

    pub fn get(&self, id: TaskId) -> Result<SettlementTask> {
        self.inner()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| CoinledgerError::not_found(format!("task {id}")))
    }

    /// Pending tasks of `kind` due at `now`, oldest first.
    #[must_use]
    pub fn eligible(&self, kind: TaskKind, now: DateTime<Utc>) -> Vec<SettlementTask> {
        self.inner()
            .tasks
            .values()
            .filter(|t| t.kind() == kind && t.is_eligible(now))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn pending(&self, kind: TaskKind) -> Vec<SettlementTask> {
        self.inner()
            .tasks
            .values()
            .filter(|t| t.kind() == kind && t.is_pending())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn has_pending(&self, owner: AccountId, kind: TaskKind) -> bool {
        PendingTasks {
            inner: &self.inner(),
        }
        .has_pending(owner, kind)
    }

    #[must_use]
    pub fn pending_total(&self, owner: AccountId, kind: TaskKind) -> Decimal {
        PendingTasks {
            inner: &self.inner(),
        }
        .pending_total(owner, kind)
    }

    /// Σ amounts of all non-completed tasks, per kind.
    #[must_use]
    pub fn pending_totals(&self) -> BTreeMap<TaskKind, Decimal> {
        let mut out = BTreeMap::new();
        for t in self.inner().tasks.values().filter(|t| !t.is_completed()) {
            *out.entry(t.kind()).or_insert(Decimal::ZERO) += t.amount;
        }
        out
    }

    #[must_use]
    pub fn suspended(&self) -> Vec<SettlementTask> {
        self.inner()
            .tasks
            .values()
            .filter(|t| t.is_suspended())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn incidents(&self) -> Vec<Incident> {
        self.inner().incidents.clone()
    }

    /// Every task, for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SettlementTask> {
        self.inner().tasks.values().cloned().collect()
    }

    // =================================================================
    // Transitions
    // =================================================================

    fn pending_mut(inner: &mut Inner, id: TaskId) -> Result<&mut SettlementTask> {
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CoinledgerError::not_found(format!("task {id}")))?;
        match task.state {
            TaskState::Pending => Ok(task),
            TaskState::Completed => Err(CoinledgerError::AlreadyCompleted(id)),
            TaskState::Suspended { .. } => {
                Err(CoinledgerError::not_found(format!("task {id} is SUSPENDED")))
            }
        }
    }

    pub fn record_attempt(&self, id: TaskId) -> Result<()> {
        let mut inner = self.inner();
        Self::pending_mut(&mut inner, id)?.attempts += 1;
        Ok(())
    }

    /// Flip the completion flag.
    ///
    /// # Errors
    /// [`CoinledgerError::AlreadyCompleted`] on a second flip.
    pub fn complete(&self, id: TaskId, txid: Option<String>, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner();
        let task = Self::pending_mut(&mut inner, id)?;
        task.state = TaskState::Completed;
        task.completed_at = Some(now);
        task.txid = txid;
        tracing::debug!(task = %id, "task completed");
        Ok(())
    }

    /// Run `f` and flip the flag in one step. `f` sees the task as it is
    /// under the lock; if it fails the task stays pending.
    pub fn settle<T>(
        &self,
        id: TaskId,
        txid: Option<String>,
        now: DateTime<Utc>,
        f: impl FnOnce(&SettlementTask) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner();
        let task = Self::pending_mut(&mut inner, id)?;
        task.attempts += 1;
        let value = f(task)?;
        task.state = TaskState::Completed;
        task.completed_at = Some(now);
        task.txid = txid;
        Ok(value)
    }

    /// [`TaskStore::settle`] over several tasks: either all of them complete
    /// or, when `f` fails, none do.
    pub fn settle_all<T>(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
        f: impl FnOnce(&[SettlementTask]) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner();
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(Self::pending_mut(&mut inner, *id)?.clone());
        }
        let value = f(&tasks)?;
        for id in ids {
            let task = Self::pending_mut(&mut inner, *id)?;
            task.attempts += 1;
            task.state = TaskState::Completed;
            task.completed_at = Some(now);
        }
        Ok(value)
    }

    /// Edit a pending task's payload.
    pub fn update_payload<T>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskPayload) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner();
        f(&mut Self::pending_mut(&mut inner, id)?.payload)
    }

    /// Park a task whose external outcome is unknown.
    pub fn suspend(&self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner();
        let task = Self::pending_mut(&mut inner, id)?;
        task.state = TaskState::Suspended {
            reason: reason.to_string(),
        };
        let incident = Incident {
            task: Some(id),
            account: task.owner,
            amount: task.amount,
            reason: reason.to_string(),
            at: now,
        };
        inner.incidents.push(incident);
        tracing::error!(task = %id, reason, "task suspended for manual reconciliation");
        Ok(())
    }

    /// Record an ambiguous send that did not belong to a task.
    pub fn record_incident(&self, account: AccountId, amount: Decimal, reason: &str, now: DateTime<Utc>) {
        self.inner().incidents.push(Incident {
            task: None,
            account,
            amount,
            reason: reason.to_string(),
            at: now,
        });
        tracing::error!(account = %account, amount = %amount, reason, "ambiguous send recorded");
    }

    /// Operator decision on a suspended task.
    pub fn resolve_suspended(
        &self,
        id: TaskId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<SettlementTask> {
        let mut inner = self.inner();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| CoinledgerError::not_found(format!("task {id}")))?;
        if !task.is_suspended() {
            return Err(CoinledgerError::invalid(format!(
                "task {id} is {}, not SUSPENDED",
                task.state
            )));
        }
        match resolution {
            Resolution::Completed => {
                task.state = TaskState::Completed;
                task.completed_at = Some(now);
            }
            Resolution::Retry => task.state = TaskState::Pending,
        }
        tracing::info!(task = %id, ?resolution, "suspended task resolved");
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn rain(owner: i64, now: DateTime<Utc>) -> TaskDraft {
        TaskDraft::new(AccountId(owner), Decimal::ONE, TaskPayload::Rain, now)
    }

    #[test]
    fn ids_are_monotonic_and_eligible_is_ordered() {
        let store = TaskStore::new();
        let now = Utc::now();
        let a = store.enqueue(rain(1, now));
        let b = store.enqueue(rain(2, now));
        let later = store.enqueue(rain(3, now).eligible_at(now + Duration::hours(1)));
        assert!(a.id < b.id && b.id < later.id);

        let due: Vec<TaskId> = store.eligible(TaskKind::Rain, now).iter().map(|t| t.id).collect();
        assert_eq!(due, vec![a.id, b.id]);
        assert_eq!(store.eligible(TaskKind::Rain, now + Duration::hours(1)).len(), 3);
    }

    #[test]
    fn completion_flips_once() {
        let store = TaskStore::new();
        let now = Utc::now();
        let t = store.enqueue(rain(1, now));
        store.complete(t.id, Some("tx".into()), now).unwrap();
        let err = store.complete(t.id, None, now).unwrap_err();
        assert!(matches!(err, CoinledgerError::AlreadyCompleted(id) if id == t.id));
        assert_eq!(store.get(t.id).unwrap().txid.as_deref(), Some("tx"));
        assert!(store.eligible(TaskKind::Rain, now).is_empty());
    }

    #[test]
    fn failed_settle_leaves_task_pending() {
        let store = TaskStore::new();
        let now = Utc::now();
        let t = store.enqueue(rain(1, now));
        let err = store
            .settle(t.id, None, now, |_| -> Result<()> { Err(CoinledgerError::invalid("nope")) })
            .unwrap_err();
        assert!(matches!(err, CoinledgerError::InvalidArgument { .. }));
        let after = store.get(t.id).unwrap();
        assert!(after.is_pending());
        assert_eq!(after.attempts, 1);

        store.settle(t.id, None, now, |_| Ok(())).unwrap();
        assert!(store.settle(t.id, None, now, |_| Ok(())).is_err());
    }

    #[test]
    fn settle_all_is_all_or_nothing() {
        let store = TaskStore::new();
        let now = Utc::now();
        let a = store.enqueue(rain(1, now)).id;
        let b = store.enqueue(rain(2, now)).id;

        let err = store.settle_all(&[a, b], now, |_| -> Result<()> {
            Err(CoinledgerError::invalid("no"))
        });
        assert!(err.is_err());
        assert_eq!(store.pending(TaskKind::Rain).len(), 2);

        let owners = store
            .settle_all(&[a, b], now, |tasks| Ok(tasks.iter().map(|t| t.owner).collect::<Vec<_>>()))
            .unwrap();
        assert_eq!(owners, vec![AccountId(1), AccountId(2)]);
        assert!(store.pending(TaskKind::Rain).is_empty());
        assert!(matches!(
            store.settle_all(&[a], now, |_| Ok(())),
            Err(CoinledgerError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn failed_funding_creates_nothing() {
        let store = TaskStore::new();
        let now = Utc::now();
        let res = store.enqueue_with(vec![rain(1, now), rain(2, now)], |_, ids| -> Result<()> {
            assert_eq!(ids, &[TaskId(1), TaskId(2)]);
            Err(CoinledgerError::invalid("short"))
        });
        assert!(res.is_err());
        assert!(store.snapshot().is_empty());

        let (tasks, ()) = store.enqueue_with(vec![rain(1, now)], |_, _| Ok(())).unwrap();
        assert_eq!(tasks[0].id, TaskId(1));
    }

    #[test]
    fn pending_view_sees_existing_requests() {
        let store = TaskStore::new();
        let now = Utc::now();
        let draft = || {
            TaskDraft::new(
                AccountId(4),
                Decimal::from(20),
                TaskPayload::MasternodeInvest {
                    amount_without_fee: Decimal::from(19),
                },
                now,
            )
        };
        store.enqueue(draft());
        let err = store
            .enqueue_with(vec![draft()], |pending, _| {
                if pending.has_pending(AccountId(4), TaskKind::MasternodeInvest) {
                    return Err(CoinledgerError::PendingRequestExists {
                        account: AccountId(4),
                        kind: TaskKind::MasternodeInvest.to_string(),
                    });
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CoinledgerError::PendingRequestExists { .. }));
        assert_eq!(
            store.pending_total(AccountId(4), TaskKind::MasternodeInvest),
            Decimal::from(20)
        );
    }

    #[test]
    fn suspension_and_resolution() {
        let store = TaskStore::new();
        let now = Utc::now();
        let t = store.enqueue(rain(1, now));
        store.suspend(t.id, "broadcast timed out", now).unwrap();
        assert!(store.eligible(TaskKind::Rain, now).is_empty());
        assert_eq!(store.suspended().len(), 1);
        assert_eq!(store.incidents()[0].task, Some(t.id));
        assert!(matches!(store.complete(t.id, None, now), Err(CoinledgerError::NotFound { .. })));

        let back = store.resolve_suspended(t.id, Resolution::Retry, now).unwrap();
        assert!(back.is_pending());
        assert!(store.resolve_suspended(t.id, Resolution::Completed, now).is_err());

        store.suspend(t.id, "again", now).unwrap();
        let done = store.resolve_suspended(t.id, Resolution::Completed, now).unwrap();
        assert!(done.is_completed());
    }

    #[test]
    fn snapshot_restores_ids() {
        let store = TaskStore::new();
        let now = Utc::now();
        store.enqueue(rain(1, now));
        store.enqueue(rain(1, now));
        let restored = TaskStore::from_tasks(store.snapshot());
        assert_eq!(restored.enqueue(rain(1, now)).id, TaskId(3));
        assert_eq!(restored.pending_totals()[&TaskKind::Rain], Decimal::from(3));
    }
}
