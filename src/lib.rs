//! Conveyor - a crash-tolerant task pipeline.
//!
//! Units of work travel from creation to completion across five worker
//! pools, with a relational store as the single source of truth for task
//! state and an at-least-once queue as transport between stages. The store's
//! skip-locked acquisition and attempt-guarded completion are the only
//! coordination; every handler is idempotent, so redelivery is safe.

pub mod chaos;
pub mod config;
pub mod envelope;
pub mod handlers;
pub mod pool;
pub mod queue;
pub mod stages;
pub mod store;
pub mod task;

pub use chaos::{ChaosInjector, SyntheticFault};
pub use config::Config;
pub use envelope::{EnvelopeError, Request, Response};
pub use handlers::{handler_registry, DummyHandler, ExportHandler, Handler, HandlerRegistry};
pub use pool::{Stage, StagePool};
pub use queue::{DeliveryHandle, MemoryQueue, QueueClient, QueueError, ReceivedMessage};
pub use stages::{Resulter, Scheduler, Submitter, TaskExpirer, TaskRepairer, Worker};
pub use store::{
    MemoryObjectStore, MemoryTaskStore, ObjectRecord, ObjectStore, PgObjectStore, PgTaskStore,
    StoreError, TaskStore,
};
pub use task::{KvMap, Task, TaskAction, TaskOutcome, TaskState, BACKOFF_STEP_SECS, MAX_ATTEMPTS};
