//! Durable task repository: the single source of truth for task state.
//!
//! The [`TaskStore`] trait is the storage contract for the task state
//! machine. All cross-process coordination happens through it; acquisition
//! is a single atomic read-modify-write and completion is guarded by the
//! attempt number, so no external lock manager is needed.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryObjectStore, MemoryTaskStore};
pub use postgres::{PgObjectStore, PgTaskStore};

use crate::chaos::SyntheticFault;
use crate::task::{KvMap, Task, TaskAction, TaskOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The business key already has a task; callers treat this as success.
    #[error("duplicated task")]
    DuplicateTask,
    /// Nothing is runnable right now; triggers backoff, not alarm.
    #[error("no eligible task")]
    NoEligibleTask,
    /// A newer attempt superseded this completion; drop silently.
    #[error("stale update: attempt already superseded")]
    StaleUpdate,
    /// The referenced business object has already been exported.
    #[error("object already exported")]
    DuplicateObject,
    #[error("object {0} not found")]
    ObjectNotFound(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Chaos(#[from] SyntheticFault),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a SCHEDULED task. Fails with [`StoreError::DuplicateTask`]
    /// when the (action, business key) uniqueness constraint is hit.
    async fn enqueue(&self, action: TaskAction, payload: KvMap) -> StoreResult<i64>;

    /// Atomically select one eligible task (SCHEDULED or ERROR with an
    /// elapsed delay), mark it ACQUIRED, increment attempts and clear the
    /// delay. Skips rows claimed by concurrent acquirers; never blocks and
    /// never returns the same row to two callers. The returned payload
    /// carries the current attempt under the `attempt` key.
    async fn acquire_next(&self) -> StoreResult<Task>;

    /// Conditionally complete a task currently ACQUIRED at `attempt`.
    /// Success moves it to SUCCESS; failure moves it to ERROR with
    /// `delayed_until = now + 5 * attempts` seconds, or CRITICAL_ERROR once
    /// attempts has reached the maximum. A mismatched attempt is a no-op
    /// reported as [`StoreError::StaleUpdate`].
    async fn complete_task(&self, id: i64, attempt: i32, outcome: TaskOutcome) -> StoreResult<()>;

    /// Apply the failure-path rule to up to `batch_size` tasks left
    /// ACQUIRED longer than `timeout`. Returns the number repaired.
    async fn repair_stale(&self, timeout: Duration, batch_size: i64) -> StoreResult<u64>;

    /// Delete SUCCESS tasks untouched for longer than `ttl`. Returns the
    /// number deleted.
    async fn expire_old(&self, ttl: Duration) -> StoreResult<u64>;
}

/// A business-logic object, the subject of the export action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: i64,
    pub data: KvMap,
}

/// Source and destination for the export handler. Exporting the same object
/// twice is reported as [`StoreError::DuplicateObject`], which callers treat
/// as success.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch_object(&self, id: i64) -> StoreResult<ObjectRecord>;
    async fn export_object(&self, object: &ObjectRecord) -> StoreResult<()>;
}
