//! Submitter stage: turns submit envelopes into SCHEDULED tasks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::chaos::ChaosInjector;
use crate::envelope::{EnvelopeError, Request};
use crate::pool::Stage;
use crate::queue::{QueueClient, QueueError, ReceivedMessage};
use crate::store::{StoreError, TaskStore};
use crate::task::TaskAction;

pub struct Submitter<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    chaos: ChaosInjector,
}

impl<S, Q> Submitter<S, Q>
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

    /// Drop a poison message: log, acknowledge so it leaves the queue, and
    /// treat the iteration as done. There is no dead-letter path.
    async fn drop_poison(&self, msg: &ReceivedMessage, reason: &str) -> Result<()> {
        warn!(reason, body = %msg.body, "dropping poison submit message");
        self.chaos.inject(self.queue.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}

#[async_trait]
impl<S, Q> Stage for Submitter<S, Q>
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

        let request = match self.chaos.inject(Request::decode(&msg.body)) {
            Ok(request) => request,
            Err(err @ EnvelopeError::Chaos(_)) => return Err(err.into()),
            Err(err) => return self.drop_poison(&msg, &err.to_string()).await,
        };

        let Some(action) = TaskAction::parse_submit_method(&request.method) else {
            return self
                .drop_poison(&msg, &format!("unknown method {:?}", request.method))
                .await;
        };
        if !request.params.contains_key("objectID") {
            return self.drop_poison(&msg, "missing objectID").await;
        }

        let object_id = request.params.get("objectID").cloned().unwrap_or_default();
        match self
            .chaos
            .inject(self.store.enqueue(action, request.params).await)
        {
            Ok(task_id) => {
                info!(task_id, action = %action, object_id = %object_id, "task submitted");
            }
            Err(StoreError::DuplicateTask) => {
                // Benign: the object already has a task for this action.
                warn!(action = %action, object_id = %object_id, "duplicate submission ignored");
            }
            // Message stays unacknowledged; the queue redelivers it.
            Err(err) => return Err(err.into()),
        }

        self.chaos.inject(self.queue.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}
