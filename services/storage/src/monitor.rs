use crate::alarm::{AlarmEvaluator, AlarmTransition, ThresholdAlarm};
use crate::config::Config;
use crate::database;
use crate::delta_log::{DeltaLog, MemoryDeltaLog, PgDeltaLog};
use crate::metric::MetricExtractor;
use crate::object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
use crate::pg_queue::PgQueue;
use crate::remediation::Remediator;
use crate::size_tracker::SizeTracker;
use crate::usage_logger::UsageLogger;
use crate::usage_store::{MemoryUsageTable, PgUsageTable, UsageTable};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use usage_pipeline::{FanoutBus, MemoryQueue, WorkQueue, WorkerPool};

/// Subscriber and queue name of the size-tracking consumer
pub const SIZE_TRACKING: &str = "size-tracking";
/// Subscriber and queue name of the usage-logging consumer
pub const USAGE_LOGGING: &str = "usage-logging";

const TRANSITION_CAPACITY: usize = 64;

/// Storage handles the monitor runs against
pub struct Backends {
    pub object_store: Arc<dyn ObjectStore>,
    pub usage_table: Arc<dyn UsageTable>,
    pub delta_log: Arc<dyn DeltaLog>,
    pub size_queue: Arc<dyn WorkQueue>,
    pub log_queue: Arc<dyn WorkQueue>,
}

impl Backends {
    /// Everything in process; `object_store` publishes its changes to `bus`
    pub fn in_memory(config: &Config, bus: Arc<FanoutBus>) -> Self {
        Self {
            object_store: Arc::new(MemoryObjectStore::with_bus(bus)),
            usage_table: Arc::new(MemoryUsageTable::new()),
            delta_log: Arc::new(MemoryDeltaLog::new()),
            size_queue: Arc::new(MemoryQueue::new(SIZE_TRACKING, config.queue.clone())),
            log_queue: Arc::new(MemoryQueue::new(USAGE_LOGGING, config.queue.clone())),
        }
    }

    /// Postgres and S3 where configured, in-memory otherwise
    pub async fn from_config(config: &Config, bus: Arc<FanoutBus>) -> Result<Self> {
        let mut backends = Self::in_memory(config, bus);

        if let Some(db) = &config.database {
            let pool = database::connect(db)
                .await
                .context("Failed to initialize database")?;

            backends.usage_table = Arc::new(PgUsageTable::new(pool.clone()));
            backends.delta_log = Arc::new(PgDeltaLog::new(pool.clone()));
            backends.size_queue = Arc::new(PgQueue::new(pool.clone(), SIZE_TRACKING, config.queue.clone()));
            backends.log_queue = Arc::new(PgQueue::new(pool, USAGE_LOGGING, config.queue.clone()));
            info!("Using PostgreSQL backends");
        } else {
            info!("No database configured, using in-memory backends");
        }

        if let Some(s3) = &config.s3 {
            backends.object_store = Arc::new(
                S3ObjectStore::new(s3)
                    .await
                    .context("Failed to initialize S3 object store")?,
            );
        }

        Ok(backends)
    }
}

/// The running pipeline: two consumer pools, the alarm evaluator and the
/// remediation subscriber
pub struct Monitor {
    shutdown: CancellationToken,
    size_pool: WorkerPool,
    log_pool: WorkerPool,
    evaluator: JoinHandle<()>,
    remediator: JoinHandle<()>,
    transitions: broadcast::Sender<AlarmTransition>,
}

impl Monitor {
    /// Subscribe both consumer queues to `bus` and start every task
    pub fn start(config: &Config, backends: &Backends, bus: &FanoutBus) -> Result<Self> {
        bus.subscribe(SIZE_TRACKING, backends.size_queue.clone())
            .context("Failed to subscribe size-tracking queue")?;
        bus.subscribe(USAGE_LOGGING, backends.log_queue.clone())
            .context("Failed to subscribe usage-logging queue")?;

        let shutdown = CancellationToken::new();

        let size_tracker = Arc::new(SizeTracker::new(
            backends.usage_table.clone(),
            config.tracking.clone(),
        ));
        let size_pool = WorkerPool::spawn(
            SIZE_TRACKING,
            backends.size_queue.clone(),
            size_tracker,
            &config.queue,
            &shutdown,
        );

        let usage_logger = Arc::new(UsageLogger::new(
            backends.delta_log.clone(),
            config.tracking.clone(),
        ));
        let log_pool = WorkerPool::spawn(
            USAGE_LOGGING,
            backends.log_queue.clone(),
            usage_logger,
            &config.queue,
            &shutdown,
        );

        let (transitions, receiver) = broadcast::channel(TRANSITION_CAPACITY);

        let extractor = MetricExtractor::new(backends.delta_log.clone(), config.alarm_period())
            .for_store(config.alarm.store_id.clone());
        let evaluator = AlarmEvaluator::new(
            extractor,
            ThresholdAlarm::new(&config.alarm),
            config.alarm_period(),
            transitions.clone(),
        )
        .with_settle(config.alarm_settle());
        let evaluator = tokio::spawn(evaluator.run(shutdown.child_token()));

        let remediator = Remediator::new(
            backends.object_store.clone(),
            config.remediation.strategy,
            config.tracking.clone(),
        );
        let remediator_shutdown = shutdown.child_token();
        let remediator =
            tokio::spawn(async move { remediator.run(receiver, remediator_shutdown).await });

        info!(
            store_id = %config.alarm.store_id,
            threshold_bytes = config.alarm.threshold_bytes,
            "Storage monitor started"
        );

        Ok(Self {
            shutdown,
            size_pool,
            log_pool,
            evaluator,
            remediator,
            transitions,
        })
    }

    /// Receiver for alarm transitions
    pub fn transitions(&self) -> broadcast::Receiver<AlarmTransition> {
        self.transitions.subscribe()
    }

    /// Stop every task; in-flight leases lapse and are redelivered later
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.size_pool.shutdown().await;
        self.log_pool.shutdown().await;

        for (name, handle) in [("alarm evaluator", self.evaluator), ("remediator", self.remediator)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task panicked");
            }
        }

        info!("Storage monitor stopped");
    }
}
