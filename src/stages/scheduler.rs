//! Scheduler stage: acquires runnable tasks and dispatches them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::chaos::ChaosInjector;
use crate::envelope::Request;
use crate::pool::Stage;
use crate::queue::QueueClient;
use crate::store::{StoreError, TaskStore};

pub struct Scheduler<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    chaos: ChaosInjector,
    /// Sleep between polls when the store has nothing runnable.
    idle_backoff: Duration,
}

impl<S, Q> Scheduler<S, Q>
where
    S: TaskStore,
    Q: QueueClient,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, chaos: ChaosInjector, idle_backoff: Duration) -> Self {
        Self {
            store,
            queue,
            chaos,
            idle_backoff,
        }
    }
}

#[async_trait]
impl<S, Q> Stage for Scheduler<S, Q>
where
    S: TaskStore + 'static,
    Q: QueueClient + 'static,
{
    async fn run_once(&mut self) -> Result<()> {
        let task = match self.chaos.inject(self.store.acquire_next().await) {
            Ok(task) => task,
            Err(StoreError::NoEligibleTask) => {
                debug!("no eligible task, backing off");
                sleep(self.idle_backoff).await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            task_id = task.id,
            action = %task.action,
            attempt = task.attempts,
            "acquired task"
        );

        // A failure past this point leaves the task ACQUIRED; the
        // supervisor repairs it once it turns stale.
        let request = Request::new(task.id.to_string(), task.action.as_str(), task.payload);
        let body = self.chaos.inject(request.encode())?;
        self.chaos.inject(self.queue.send_message(body).await)?;
        info!(task_id = task.id, "task dispatched");
        Ok(())
    }
}
