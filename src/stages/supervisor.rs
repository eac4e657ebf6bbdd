//! Supervisor stage: store housekeeping, no queue interaction.
//!
//! Two independent timer loops. [`TaskRepairer`] moves tasks left ACQUIRED
//! past the stale timeout back through the failure path; [`TaskExpirer`]
//! deletes SUCCESS rows older than the configured TTL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::chaos::ChaosInjector;
use crate::pool::Stage;
use crate::store::TaskStore;

pub struct TaskRepairer<S> {
    store: Arc<S>,
    chaos: ChaosInjector,
    interval: Duration,
    stale_timeout: Duration,
    batch_size: i64,
}

impl<S: TaskStore> TaskRepairer<S> {
    pub fn new(
        store: Arc<S>,
        chaos: ChaosInjector,
        interval: Duration,
        stale_timeout: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            chaos,
            interval,
            stale_timeout,
            batch_size,
        }
    }
}

#[async_trait]
impl<S: TaskStore + 'static> Stage for TaskRepairer<S> {
    async fn run_once(&mut self) -> Result<()> {
        sleep(self.interval).await;
        let repaired = self.chaos.inject(
            self.store
                .repair_stale(self.stale_timeout, self.batch_size)
                .await,
        )?;
        if repaired > 0 {
            info!(repaired, "repaired stale tasks");
        } else {
            debug!("no stale tasks");
        }
        Ok(())
    }
}

pub struct TaskExpirer<S> {
    store: Arc<S>,
    chaos: ChaosInjector,
    interval: Duration,
    ttl: Duration,
}

impl<S: TaskStore> TaskExpirer<S> {
    pub fn new(store: Arc<S>, chaos: ChaosInjector, interval: Duration, ttl: Duration) -> Self {
        Self {
            store,
            chaos,
            interval,
            ttl,
        }
    }
}

#[async_trait]
impl<S: TaskStore + 'static> Stage for TaskExpirer<S> {
    async fn run_once(&mut self) -> Result<()> {
        sleep(self.interval).await;
        let expired = self.chaos.inject(self.store.expire_old(self.ttl).await)?;
        if expired > 0 {
            info!(expired, "expired completed tasks");
        } else {
            debug!("nothing to expire");
        }
        Ok(())
    }
}
