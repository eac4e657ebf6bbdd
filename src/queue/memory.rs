//! In-process queue with SQS-like visibility-timeout semantics.
//!
//! Backs the broker-less local mode and the integration tests. Delivery is
//! deliberately at-least-once: an unacknowledged message returns to the
//! ready list once its visibility timeout elapses, under a fresh delivery
//! handle.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};

use super::{DeliveryHandle, QueueClient, QueueError, QueueResult, ReceivedMessage};

const RECEIVE_POLL_STEP: Duration = Duration::from_millis(20);

struct InFlight {
    body: String,
    redeliver_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_delivery: u64,
    ready: VecDeque<String>,
    inflight: HashMap<u64, InFlight>,
}

#[derive(Clone)]
pub struct MemoryQueue {
    name: &'static str,
    visibility_timeout: Duration,
    receive_wait: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    pub fn new(name: &'static str, visibility_timeout: Duration, receive_wait: Duration) -> Self {
        Self {
            name,
            visibility_timeout,
            receive_wait,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Messages currently waiting for delivery (in-flight excluded).
    pub fn ready_len(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::requeue_expired(&mut inner);
        inner.ready.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .inflight
            .len()
    }

    fn requeue_expired(inner: &mut Inner) {
        let now = Utc::now();
        let expired: Vec<u64> = inner
            .inflight
            .iter()
            .filter(|(_, m)| m.redeliver_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(message) = inner.inflight.remove(&id) {
                inner.ready.push_back(message.body);
            }
        }
    }

    fn try_receive(&self) -> Option<ReceivedMessage> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::requeue_expired(&mut inner);
        let body = inner.ready.pop_front()?;
        inner.next_delivery += 1;
        let delivery = inner.next_delivery;
        let redeliver_at = Utc::now()
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        inner.inflight.insert(
            delivery,
            InFlight {
                body: body.clone(),
                redeliver_at,
            },
        );
        Some(ReceivedMessage {
            body,
            handle: DeliveryHandle(delivery),
        })
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn send_message(&self, body: String) -> QueueResult<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.ready.push_back(body);
        Ok(())
    }

    async fn receive_message(&self) -> QueueResult<ReceivedMessage> {
        let deadline = Instant::now() + self.receive_wait;
        loop {
            if let Some(message) = self.try_receive() {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(QueueError::NoMessage);
            }
            sleep(RECEIVE_POLL_STEP.min(self.receive_wait)).await;
        }
    }

    async fn acknowledge(&self, handle: &DeliveryHandle) -> QueueResult<()> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        // Unknown handles mean the delivery already expired and the message
        // was redelivered; acknowledging is then a no-op.
        inner.inflight.remove(&handle.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility_ms: u64, wait_ms: u64) -> MemoryQueue {
        MemoryQueue::new(
            "test",
            Duration::from_millis(visibility_ms),
            Duration::from_millis(wait_ms),
        )
    }

    #[tokio::test]
    async fn acknowledged_message_is_gone() {
        let q = queue(50, 50);
        q.send_message("a".into()).await.expect("send");
        let msg = q.receive_message().await.expect("receive");
        q.acknowledge(&msg.handle).await.expect("ack");

        sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            q.receive_message().await,
            Err(QueueError::NoMessage)
        ));
        assert_eq!(q.inflight_len(), 0);
    }

    #[tokio::test]
    async fn unacknowledged_message_reappears_after_visibility_timeout() {
        let q = queue(40, 200);
        q.send_message("a".into()).await.expect("send");
        let first = q.receive_message().await.expect("receive");

        // Invisible while in flight, redelivered afterwards.
        assert_eq!(q.ready_len(), 0);
        let second = q.receive_message().await.expect("redelivery");
        assert_eq!(second.body, "a");
        assert_ne!(first.handle, second.handle);

        // Acking the expired first handle changes nothing.
        q.acknowledge(&first.handle).await.expect("stale ack");
        assert_eq!(q.inflight_len(), 1);
    }

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let q = queue(50, 30);
        let started = Instant::now();
        assert!(matches!(
            q.receive_message().await,
            Err(QueueError::NoMessage)
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
