//! The five pipeline stages, each a [`crate::pool::Stage`] implementation.
//!
//! Submitter: queue to store. Scheduler: store to queue. Worker: queue to
//! queue, executing handlers. Resulter: queue to store. Supervisor: store
//! housekeeping only (stale-task repair and success expiry).

mod resulter;
mod scheduler;
mod submitter;
mod supervisor;
mod worker;

pub use resulter::Resulter;
pub use scheduler::Scheduler;
pub use submitter::Submitter;
pub use supervisor::{TaskExpirer, TaskRepairer};
pub use worker::Worker;
