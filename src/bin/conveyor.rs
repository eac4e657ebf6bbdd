//! Run the whole pipeline in one process: Postgres store, in-process
//! queues, all five stages. Optionally seeds demo traffic so the retry and
//! housekeeping paths have something to chew on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use conveyor::{
    handler_registry, ChaosInjector, Config, KvMap, MemoryQueue, PgObjectStore, PgTaskStore,
    QueueClient, Request, Resulter, Scheduler, StagePool, Submitter, TaskExpirer, TaskRepairer,
    Worker,
};

#[derive(Parser, Debug)]
#[command(name = "conveyor", about = "Crash-tolerant task pipeline")]
struct Args {
    /// Exit after this many seconds instead of waiting for ctrl-c.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Milliseconds between seeded demo submissions; 0 disables seeding.
    #[arg(long, default_value_t = 1000)]
    seed_interval_ms: u64,

    /// Override CONVEYOR_CHAOS_PROBABILITY.
    #[arg(long)]
    chaos: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(chaos) = args.chaos {
        config.chaos_probability = chaos;
    }

    // An unreachable store at startup is the one fatal error.
    let store = Arc::new(
        PgTaskStore::connect(&config.database_url)
            .await
            .context("connecting to task store")?,
    );
    store.migrate().await.context("applying schema")?;
    let objects = Arc::new(PgObjectStore::with_pool(store.pool().clone()));

    let chaos = ChaosInjector::new(config.chaos_probability);
    info!(
        chaos_probability = chaos.probability(),
        "pipeline starting"
    );

    let submit_queue = Arc::new(MemoryQueue::new(
        "submit",
        config.visibility_timeout,
        config.receive_wait,
    ));
    let dispatch_queue = Arc::new(MemoryQueue::new(
        "dispatch",
        config.visibility_timeout,
        config.receive_wait,
    ));
    let results_queue = Arc::new(MemoryQueue::new(
        "results",
        config.visibility_timeout,
        config.receive_wait,
    ));

    let handlers = Arc::new(handler_registry(Arc::clone(&objects), chaos.clone()));

    let submitter = StagePool::start("submitter", config.submitter_workers, |_| {
        Submitter::new(
            Arc::clone(&store),
            Arc::clone(&submit_queue),
            chaos.clone(),
        )
    });
    let scheduler = StagePool::start("scheduler", config.scheduler_workers, |_| {
        Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatch_queue),
            chaos.clone(),
            config.idle_backoff,
        )
    });
    let worker = StagePool::start("worker", config.worker_workers, |_| {
        Worker::new(
            Arc::clone(&dispatch_queue),
            Arc::clone(&results_queue),
            Arc::clone(&handlers),
            chaos.clone(),
        )
    });
    let resulter = StagePool::start("resulter", config.resulter_workers, |_| {
        Resulter::new(
            Arc::clone(&store),
            Arc::clone(&results_queue),
            chaos.clone(),
        )
    });
    let repairer = StagePool::start("supervisor-repair", 1, |_| {
        TaskRepairer::new(
            Arc::clone(&store),
            chaos.clone(),
            config.supervisor_interval,
            config.stale_timeout,
            config.repair_batch_size,
        )
    });
    let expirer = StagePool::start("supervisor-expire", 1, |_| {
        TaskExpirer::new(
            Arc::clone(&store),
            chaos.clone(),
            config.supervisor_interval,
            config.success_ttl,
        )
    });

    let (seed_shutdown_tx, seed_shutdown_rx) = watch::channel(false);
    let seed_handle = if args.seed_interval_ms > 0 {
        Some(tokio::spawn(seed_loop(
            Arc::clone(&objects),
            Arc::clone(&submit_queue),
            Duration::from_millis(args.seed_interval_ms),
            seed_shutdown_rx,
        )))
    } else {
        None
    };

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("run duration elapsed"),
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("interrupt received");
        }
    }

    info!("shutting down");
    let _ = seed_shutdown_tx.send(true);
    if let Some(handle) = seed_handle {
        let _ = handle.await;
    }
    submitter.shutdown().await;
    scheduler.shutdown().await;
    worker.shutdown().await;
    resulter.shutdown().await;
    repairer.shutdown().await;
    expirer.shutdown().await;
    info!("pipeline stopped");
    Ok(())
}

/// Insert a fresh business object and submit an export request for it.
async fn seed_loop(
    objects: Arc<PgObjectStore>,
    submit_queue: Arc<MemoryQueue>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis(), "seed loop started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("seed loop shutting down");
                    return;
                }
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = seed_one(&objects, &submit_queue).await {
                    warn!(error = %err, "seed iteration failed");
                }
            }
        }
    }
}

async fn seed_one(objects: &PgObjectStore, submit_queue: &MemoryQueue) -> Result<()> {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let data = KvMap::from([("random".to_string(), random)]);
    let object_id = objects.insert_object(&data).await?;

    let request = Request::new(
        String::new(),
        "submit:export",
        KvMap::from([("objectID".to_string(), object_id.to_string())]),
    );
    submit_queue.send_message(request.encode()?).await?;
    info!(object_id, "seeded export submission");
    Ok(())
}
