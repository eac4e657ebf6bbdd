//! At-least-once message queue abstraction between pipeline stages.
//!
//! Any broker offering at-least-once delivery with a visibility timeout and
//! acknowledge/delete satisfies [`QueueClient`]. A received message that is
//! never acknowledged reappears after the visibility timeout, so every
//! consumer must be idempotent. No ordering is guaranteed.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryQueue;

use crate::chaos::SyntheticFault;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Bounded wait elapsed with nothing to deliver; backoff, not alarm.
    #[error("no message received")]
    NoMessage,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Chaos(#[from] SyntheticFault),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Opaque receipt for one delivery of one message. Acknowledging through a
/// handle whose delivery has already expired is a harmless no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub(crate) u64);

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub handle: DeliveryHandle,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn send_message(&self, body: String) -> QueueResult<()>;

    /// Return at most one message, waiting a bounded interval before
    /// failing with [`QueueError::NoMessage`]. The message stays invisible
    /// to other consumers until acknowledged or the visibility timeout
    /// elapses.
    async fn receive_message(&self) -> QueueResult<ReceivedMessage>;

    async fn acknowledge(&self, handle: &DeliveryHandle) -> QueueResult<()>;
}
