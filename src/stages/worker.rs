//! Worker stage: executes the handler for each dispatched task and forwards
//! the outcome to the results queue.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::chaos::ChaosInjector;
use crate::envelope::{EnvelopeError, Request};
use crate::handlers::HandlerRegistry;
use crate::pool::Stage;
use crate::queue::{QueueClient, QueueError, ReceivedMessage};
use crate::task::TaskAction;

pub struct Worker<Q> {
    source: Arc<Q>,
    results: Arc<Q>,
    handlers: Arc<HandlerRegistry>,
    chaos: ChaosInjector,
}

impl<Q: QueueClient> Worker<Q> {
    pub fn new(
        source: Arc<Q>,
        results: Arc<Q>,
        handlers: Arc<HandlerRegistry>,
        chaos: ChaosInjector,
    ) -> Self {
        Self {
            source,
            results,
            handlers,
            chaos,
        }
    }

    async fn drop_poison(&self, msg: &ReceivedMessage, reason: &str) -> Result<()> {
        warn!(reason, body = %msg.body, "dropping poison dispatch message");
        self.chaos.inject(self.source.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}

#[async_trait]
impl<Q: QueueClient + 'static> Stage for Worker<Q> {
    async fn run_once(&mut self) -> Result<()> {
        let msg = match self.chaos.inject(self.source.receive_message().await) {
            Ok(msg) => msg,
            Err(QueueError::NoMessage) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let request = match self.chaos.inject(Request::decode(&msg.body)) {
            Ok(request) => request,
            Err(err @ EnvelopeError::Chaos(_)) => return Err(err.into()),
            Err(err) => return self.drop_poison(&msg, &err.to_string()).await,
        };

        let Some(action) = TaskAction::parse(&request.method) else {
            return self
                .drop_poison(&msg, &format!("unknown action {:?}", request.method))
                .await;
        };
        // The registry covers the closed action set by construction.
        let Some(handler) = self.handlers.get(&action) else {
            return self
                .drop_poison(&msg, &format!("no handler for action {action}"))
                .await;
        };

        info!(task_id = %request.id, action = %action, "executing task");
        let response = handler.execute(&request).await;

        let body = self.chaos.inject(response.encode())?;
        self.chaos.inject(self.results.send_message(body).await)?;
        // Only acknowledge once the result is safely on the queue; a crash
        // before this point redelivers the dispatch.
        self.chaos.inject(self.source.acknowledge(&msg.handle).await)?;
        Ok(())
    }
}
