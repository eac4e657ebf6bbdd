//! In-memory store implementing the same state machine as Postgres.
//!
//! Used by tests and broker-less local runs. A single mutex stands in for
//! row-level locking, which preserves the acquisition contract: one caller
//! at a time performs the select-and-update, so no row is double-assigned.
//! The clock can be advanced to exercise backoff and staleness without
//! real waits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ObjectRecord, ObjectStore, StoreError, StoreResult, TaskStore};
use crate::task::{KvMap, Task, TaskAction, TaskOutcome, TaskState, BACKOFF_STEP_SECS, MAX_ATTEMPTS};

#[derive(Default)]
struct Inner {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
    clock_offset: chrono::Duration,
}

#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the store's notion of "now" forward. Lets tests elapse backoff
    /// delays and stale timeouts instantly.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.clock_offset = inner.clock_offset
            + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Snapshot one task.
    pub fn task(&self, id: i64) -> Option<Task> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .tasks
            .get(&id)
            .cloned()
    }

    /// Snapshot all tasks in a given state, in id order.
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<Task> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now(inner: &Inner) -> DateTime<Utc> {
        Utc::now() + inner.clock_offset
    }
}

fn backoff_delay(attempts: i32) -> chrono::Duration {
    chrono::Duration::seconds(BACKOFF_STEP_SECS * i64::from(attempts))
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn enqueue(&self, action: TaskAction, payload: KvMap) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(key) = payload.get("objectID") {
            let duplicate = inner
                .tasks
                .values()
                .any(|t| t.action == action && t.payload.get("objectID") == Some(key));
            if duplicate {
                return Err(StoreError::DuplicateTask);
            }
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Self::now(&inner);
        inner.tasks.insert(
            id,
            Task {
                id,
                action,
                payload,
                state: TaskState::Scheduled,
                attempts: 0,
                result: KvMap::new(),
                error: KvMap::new(),
                created_at: now,
                updated_at: now,
                delayed_until: None,
            },
        );
        Ok(id)
    }

    async fn acquire_next(&self) -> StoreResult<Task> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let now = Self::now(&inner);
        let id = inner
            .tasks
            .values()
            .find(|t| {
                matches!(t.state, TaskState::Scheduled | TaskState::Error)
                    && t.delayed_until.is_none_or(|d| d <= now)
            })
            .map(|t| t.id)
            .ok_or(StoreError::NoEligibleTask)?;

        let task = inner.tasks.get_mut(&id).expect("task vanished under lock");
        task.state = TaskState::Acquired;
        task.attempts += 1;
        task.delayed_until = None;
        task.updated_at = now;

        let mut acquired = task.clone();
        acquired
            .payload
            .insert("attempt".to_string(), acquired.attempts.to_string());
        Ok(acquired)
    }

    async fn complete_task(&self, id: i64, attempt: i32, outcome: TaskOutcome) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let now = Self::now(&inner);
        let task = match inner.tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Acquired && task.attempts == attempt => task,
            _ => return Err(StoreError::StaleUpdate),
        };
        match outcome {
            TaskOutcome::Success(result) => {
                task.state = TaskState::Success;
                task.result = result;
                task.error = KvMap::new();
                task.delayed_until = None;
            }
            TaskOutcome::Failure(error) => {
                task.error = error;
                if task.attempts < MAX_ATTEMPTS {
                    task.state = TaskState::Error;
                    task.delayed_until = Some(now + backoff_delay(task.attempts));
                } else {
                    task.state = TaskState::CriticalError;
                    task.delayed_until = None;
                }
            }
        }
        task.updated_at = now;
        Ok(())
    }

    async fn repair_stale(&self, timeout: Duration, batch_size: i64) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let now = Self::now(&inner);
        let cutoff = now
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<i64> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Acquired && t.updated_at < cutoff)
            .map(|t| t.id)
            .take(batch_size.max(0) as usize)
            .collect();

        for id in &stale {
            let task = inner.tasks.get_mut(id).expect("task vanished under lock");
            task.attempts += 1;
            if task.attempts < MAX_ATTEMPTS {
                task.state = TaskState::Error;
                task.delayed_until = Some(now + backoff_delay(task.attempts));
            } else {
                task.state = TaskState::CriticalError;
                task.delayed_until = None;
            }
            task.error = KvMap::from([
                ("code".to_string(), "0".to_string()),
                ("message".to_string(), "stale task".to_string()),
            ]);
            task.updated_at = now;
        }
        Ok(stale.len() as u64)
    }

    async fn expire_old(&self, ttl: Duration) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let cutoff = Self::now(&inner)
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, t| !(t.state == TaskState::Success && t.updated_at < cutoff));
        Ok((before - inner.tasks.len()) as u64)
    }
}

#[derive(Default)]
struct ObjectsInner {
    next_id: i64,
    objects: BTreeMap<i64, KvMap>,
    exported: BTreeMap<i64, KvMap>,
}

/// In-memory object source/export destination for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<ObjectsInner>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_object(&self, data: KvMap) -> i64 {
        let mut inner = self.inner.lock().expect("object lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.objects.insert(id, data);
        id
    }

    pub fn exported(&self, id: i64) -> Option<KvMap> {
        self.inner
            .lock()
            .expect("object lock poisoned")
            .exported
            .get(&id)
            .cloned()
    }

    pub fn exported_count(&self) -> usize {
        self.inner.lock().expect("object lock poisoned").exported.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch_object(&self, id: i64) -> StoreResult<ObjectRecord> {
        let inner = self.inner.lock().expect("object lock poisoned");
        let data = inner
            .objects
            .get(&id)
            .cloned()
            .ok_or(StoreError::ObjectNotFound(id))?;
        Ok(ObjectRecord { id, data })
    }

    async fn export_object(&self, object: &ObjectRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("object lock poisoned");
        if inner.exported.contains_key(&object.id) {
            return Err(StoreError::DuplicateObject);
        }
        inner.exported.insert(object.id, object.data.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn payload(object_id: &str) -> KvMap {
        KvMap::from([("objectID".to_string(), object_id.to_string())])
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_under_business_key() {
        let store = MemoryTaskStore::new();
        store
            .enqueue(TaskAction::Export, payload("42"))
            .await
            .expect("first enqueue");
        let second = store.enqueue(TaskAction::Export, payload("42")).await;
        assert!(matches!(second, Err(StoreError::DuplicateTask)));
        assert_eq!(store.len(), 1);

        // A different action on the same object is a distinct task.
        store
            .enqueue(TaskAction::Dummy, payload("42"))
            .await
            .expect("different action");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn acquire_increments_attempts_and_threads_attempt_key() {
        let store = MemoryTaskStore::new();
        let id = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        let task = store.acquire_next().await.expect("acquire");
        assert_eq!(task.id, id);
        assert_eq!(task.state, TaskState::Acquired);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.payload.get("attempt").map(String::as_str), Some("1"));
        assert!(matches!(
            store.acquire_next().await,
            Err(StoreError::NoEligibleTask)
        ));
    }

    #[tokio::test]
    async fn concurrent_acquirers_never_share_a_task() {
        let store = Arc::new(MemoryTaskStore::new());
        for i in 0..8 {
            store
                .enqueue(TaskAction::Dummy, payload(&i.to_string()))
                .await
                .expect("enqueue");
        }

        // 16 racing callers over 8 eligible rows.
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.acquire_next().await }));
        }
        let mut seen = HashSet::new();
        let mut empty = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(task) => assert!(seen.insert(task.id), "task {} acquired twice", task.id),
                Err(StoreError::NoEligibleTask) => empty += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(empty, 8);
    }

    #[tokio::test]
    async fn stale_attempt_completion_is_a_noop() {
        let store = MemoryTaskStore::new();
        let id = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        store.acquire_next().await.expect("acquire");

        let outcome = TaskOutcome::Success(KvMap::new());
        let stale = store.complete_task(id, 2, outcome).await;
        assert!(matches!(stale, Err(StoreError::StaleUpdate)));
        let task = store.task(id).expect("task");
        assert_eq!(task.state, TaskState::Acquired);
        assert_eq!(task.attempts, 1);

        store
            .complete_task(id, 1, TaskOutcome::Success(KvMap::new()))
            .await
            .expect("current attempt applies");
        assert_eq!(store.task(id).expect("task").state, TaskState::Success);

        // A late duplicate of the same attempt is also a no-op.
        let dup = store
            .complete_task(id, 1, TaskOutcome::Success(KvMap::new()))
            .await;
        assert!(matches!(dup, Err(StoreError::StaleUpdate)));
    }

    #[tokio::test]
    async fn failure_backoff_is_linear_and_blocks_reselection() {
        let store = MemoryTaskStore::new();
        let id = store
            .enqueue(TaskAction::Export, payload("999"))
            .await
            .expect("enqueue");
        let task = store.acquire_next().await.expect("acquire");
        assert_eq!(task.attempts, 1);

        let before = Utc::now();
        store
            .complete_task(id, 1, TaskOutcome::Failure(KvMap::new()))
            .await
            .expect("fail");
        let task = store.task(id).expect("task");
        assert_eq!(task.state, TaskState::Error);
        let delayed = task.delayed_until.expect("delayed_until set");
        let expected = before + chrono::Duration::seconds(5);
        assert!((delayed - expected).num_milliseconds().abs() < 1_000);

        // Not eligible until the delay elapses.
        assert!(matches!(
            store.acquire_next().await,
            Err(StoreError::NoEligibleTask)
        ));
        store.advance(Duration::from_secs(6));
        let task = store.acquire_next().await.expect("re-acquire");
        assert_eq!(task.attempts, 2);

        // Second failure backs off 5 * 2 seconds.
        store
            .complete_task(id, 2, TaskOutcome::Failure(KvMap::new()))
            .await
            .expect("fail again");
        let task = store.task(id).expect("task");
        let gap = task.delayed_until.expect("delayed") - task.updated_at;
        assert_eq!(gap.num_seconds(), 10);
    }

    #[tokio::test]
    async fn critical_error_exactly_at_max_attempts() {
        let store = MemoryTaskStore::new();
        let id = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        for attempt in 1..=MAX_ATTEMPTS {
            store.advance(Duration::from_secs(60));
            let task = store.acquire_next().await.expect("acquire");
            assert_eq!(task.attempts, attempt);
            store
                .complete_task(id, attempt, TaskOutcome::Failure(KvMap::new()))
                .await
                .expect("fail");
            let state = store.task(id).expect("task").state;
            if attempt < MAX_ATTEMPTS {
                assert_eq!(state, TaskState::Error);
            } else {
                assert_eq!(state, TaskState::CriticalError);
            }
        }
        let task = store.task(id).expect("task");
        assert_eq!(task.attempts, MAX_ATTEMPTS);
        assert!(task.delayed_until.is_none());
        assert!(matches!(
            store.acquire_next().await,
            Err(StoreError::NoEligibleTask)
        ));
    }

    #[tokio::test]
    async fn repair_touches_only_stale_tasks() {
        let store = MemoryTaskStore::new();
        let stale_id = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        store.acquire_next().await.expect("acquire stale");
        store.advance(Duration::from_secs(120));

        let fresh_id = store
            .enqueue(TaskAction::Dummy, payload("2"))
            .await
            .expect("enqueue");
        store.acquire_next().await.expect("acquire fresh");

        let repaired = store
            .repair_stale(Duration::from_secs(60), 10)
            .await
            .expect("repair");
        assert_eq!(repaired, 1);

        let stale = store.task(stale_id).expect("task");
        assert_eq!(stale.state, TaskState::Error);
        assert_eq!(stale.attempts, 2);
        assert_eq!(stale.error.get("message").map(String::as_str), Some("stale task"));

        let fresh = store.task(fresh_id).expect("task");
        assert_eq!(fresh.state, TaskState::Acquired);
        assert_eq!(fresh.attempts, 1);
    }

    #[tokio::test]
    async fn repair_at_attempt_boundary_goes_critical() {
        let store = MemoryTaskStore::new();
        let id = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        for attempt in 1..MAX_ATTEMPTS {
            store.advance(Duration::from_secs(60));
            store.acquire_next().await.expect("acquire");
            store
                .complete_task(id, attempt, TaskOutcome::Failure(KvMap::new()))
                .await
                .expect("fail");
        }
        store.advance(Duration::from_secs(60));
        store.acquire_next().await.expect("final acquire");
        store.advance(Duration::from_secs(120));

        let repaired = store
            .repair_stale(Duration::from_secs(60), 10)
            .await
            .expect("repair");
        assert_eq!(repaired, 1);
        let task = store.task(id).expect("task");
        assert_eq!(task.state, TaskState::CriticalError);
        assert_eq!(task.attempts, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn expire_deletes_only_old_successes() {
        let store = MemoryTaskStore::new();
        let done = store
            .enqueue(TaskAction::Dummy, payload("1"))
            .await
            .expect("enqueue");
        store.acquire_next().await.expect("acquire");
        store
            .complete_task(done, 1, TaskOutcome::Success(KvMap::new()))
            .await
            .expect("complete");

        let pending = store
            .enqueue(TaskAction::Dummy, payload("2"))
            .await
            .expect("enqueue");

        store.advance(Duration::from_secs(7200));
        let deleted = store
            .expire_old(Duration::from_secs(3600))
            .await
            .expect("expire");
        assert_eq!(deleted, 1);
        assert!(store.task(done).is_none());
        assert!(store.task(pending).is_some());
    }

    #[tokio::test]
    async fn export_duplicate_is_reported() {
        let objects = MemoryObjectStore::new();
        let id = objects.insert_object(KvMap::from([("k".to_string(), "v".to_string())]));
        let record = objects.fetch_object(id).await.expect("fetch");
        objects.export_object(&record).await.expect("first export");
        assert!(matches!(
            objects.export_object(&record).await,
            Err(StoreError::DuplicateObject)
        ));
        assert_eq!(objects.exported_count(), 1);
    }
}
