//! Resulter stage: applies result envelopes to the store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::chaos::ChaosInjector;
use crate::envelope::{EnvelopeError, Response};
use crate::pool::Stage;
use crate::queue::{QueueClient, QueueError, ReceivedMessage};
use crate::store::{StoreError, TaskStore};
use crate::task::TaskOutcome;

pub struct Resulter<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    chaos: ChaosInjector,
}

impl<S, Q> Resulter<S, Q>
where
    S: TaskStore,
    Q: QueueClient,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, chaos: ChaosInjector) -> Self {
        Self {
            store,
            queue,
            chaos,
        }
    }

    async fn drop_poison(&self, msg: &ReceivedMessage, reason: &str) -> Result<()> {
        warn!(reason, body = %msg.body, "dropping poison result message");
        self.chaos.inject(self.queue.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}

#[async_trait]
impl<S, Q> Stage for Resulter<S, Q>
where
    S: TaskStore + 'static,
    Q: QueueClient + 'static,
{
    async fn run_once(&mut self) -> Result<()> {
        let msg = match self.chaos.inject(self.queue.receive_message().await) {
            Ok(msg) => msg,
            Err(QueueError::NoMessage) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let response = match self.chaos.inject(Response::decode(&msg.body)) {
            Ok(response) => response,
            Err(err @ EnvelopeError::Chaos(_)) => return Err(err.into()),
            Err(err) => return self.drop_poison(&msg, &err.to_string()).await,
        };

        let task_id = match response.task_id() {
            Ok(id) => id,
            Err(err) => return self.drop_poison(&msg, &err.to_string()).await,
        };
        let outcome = match (response.result, response.error) {
            (Some(result), None) => TaskOutcome::Success(result),
            (None, Some(err)) => TaskOutcome::Failure(err),
            // Unreachable after decode validation.
            _ => return self.drop_poison(&msg, "ambiguous outcome").await,
        };
        let Some(attempt) = outcome.attempt() else {
            return self.drop_poison(&msg, "missing attempt number").await;
        };

        match self
            .chaos
            .inject(self.store.complete_task(task_id, attempt, outcome).await)
        {
            Ok(()) => info!(task_id, attempt, "task completed"),
            Err(StoreError::StaleUpdate) => {
                // A newer attempt already superseded this result.
                debug!(task_id, attempt, "stale result dropped");
            }
            Err(err) => {
                // Leave the task ACQUIRED for the supervisor; the message is
                // still acknowledged so the queue keeps draining.
                error!(task_id, attempt, error = %err, "failed to store result");
            }
        }

        self.chaos.inject(self.queue.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}
