use chrono::{DateTime, TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage_monitor::config::AlarmConfig;
use storage_monitor::{
    AlarmEvaluator, AlarmState, DeltaLog, MemoryDeltaLog, MemoryObjectStore, MemoryUsageTable,
    MetricExtractor, RemediationStrategy, Remediator, SizeTracker, ThresholdAlarm,
    TrackingConfig, UsageLogger, UsageTable,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use usage_pipeline::{FanoutBus, LifecycleEvent, MemoryQueue, QueueConfig, WorkQueue, WorkerPool};

const PERIOD: Duration = Duration::from_secs(60);

fn queue_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 10,
        workers: 2,
        ..Default::default()
    }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

struct Pipeline {
    bus: Arc<FanoutBus>,
    table: Arc<MemoryUsageTable>,
    log: Arc<MemoryDeltaLog>,
    shutdown: CancellationToken,
    pools: Vec<WorkerPool>,
}

impl Pipeline {
    fn start(bus: Arc<FanoutBus>) -> Self {
        let table = Arc::new(MemoryUsageTable::new());
        let log = Arc::new(MemoryDeltaLog::new());
        let shutdown = CancellationToken::new();

        let size_queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("size-tracking", queue_config()));
        let log_queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("usage-logging", queue_config()));
        bus.subscribe("size-tracking", size_queue.clone()).unwrap();
        bus.subscribe("usage-logging", log_queue.clone()).unwrap();

        let pools = vec![
            WorkerPool::spawn(
                "size-tracking",
                size_queue,
                Arc::new(SizeTracker::new(table.clone(), TrackingConfig::default())),
                &queue_config(),
                &shutdown,
            ),
            WorkerPool::spawn(
                "usage-logging",
                log_queue,
                Arc::new(UsageLogger::new(log.clone(), TrackingConfig::default())),
                &queue_config(),
                &shutdown,
            ),
        ];

        Self {
            bus,
            table,
            log,
            shutdown,
            pools,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for pool in self.pools {
            pool.shutdown().await;
        }
    }
}

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
}

#[tokio::test]
async fn test_threshold_breach_remediates_store() {
    let bus = Arc::new(FanoutBus::new());
    let pipeline = Pipeline::start(bus.clone());

    // Objects already written; their notifications arrive through the bus
    let store = Arc::new(MemoryObjectStore::new());
    store.put_object("A", "x", 15).await;
    store.put_object("A", "y", 10).await;

    let t = window_start();
    for event in [
        LifecycleEvent::created("A", "x", 15).at(t + chrono::Duration::seconds(1)),
        LifecycleEvent::created("A", "y", 10).at(t + chrono::Duration::seconds(2)),
    ] {
        assert!(pipeline.bus.publish(&event).await.is_complete());
    }

    let table = pipeline.table.clone();
    eventually(|| {
        let table = table.clone();
        async move {
            table
                .latest("A")
                .await
                .unwrap()
                .is_some_and(|r| r.cumulative_bytes == 25)
        }
    })
    .await;

    let history = table.history("A", DateTime::<Utc>::MIN_UTC).await.unwrap();
    let totals: Vec<u64> = history.iter().map(|r| r.cumulative_bytes).collect();
    assert!(totals == vec![15, 25] || totals == vec![10, 25]);
    assert!(history[0].timestamp < history[1].timestamp);

    let log = pipeline.log.clone();
    eventually(|| {
        let log = log.clone();
        async move { log.len() == 2 }
    })
    .await;
    let mut deltas: Vec<i64> = log
        .read_from(0, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.record.size_delta)
        .collect();
    deltas.sort();
    assert_eq!(deltas, vec![10, 15]);

    // Alarm and remediation
    let (sender, receiver) = broadcast::channel(16);
    let mut evaluator = AlarmEvaluator::new(
        MetricExtractor::new(log.clone(), PERIOD).for_store("A"),
        ThresholdAlarm::new(&AlarmConfig {
            threshold_bytes: 20,
            evaluation_periods: 1,
            ..AlarmConfig::for_store("A")
        }),
        PERIOD,
        sender,
    );

    let remediator = Remediator::new(
        store.clone(),
        RemediationStrategy::DeleteAll,
        TrackingConfig::default(),
    );
    let remediation_shutdown = CancellationToken::new();
    let remediation = {
        let shutdown = remediation_shutdown.clone();
        tokio::spawn(async move { remediator.run(receiver, shutdown).await })
    };

    let transition = evaluator.evaluate_window(t).await.unwrap();
    assert_eq!(transition.from, AlarmState::InsufficientData);
    assert_eq!(transition.to, AlarmState::Alarm);
    assert_eq!(transition.reading, Some(25));

    let objects = store.clone();
    eventually(|| {
        let objects = objects.clone();
        async move { objects.object_count("A") == 0 }
    })
    .await;

    // Staying in ALARM does not remediate again; an empty next window ends it
    let next = evaluator
        .evaluate_window(t + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(next.to, AlarmState::InsufficientData);

    remediation_shutdown.cancel();
    remediation.await.unwrap();
    pipeline.stop().await;
}

#[tokio::test]
async fn test_remediation_deletions_flow_back_into_totals() {
    let bus = Arc::new(FanoutBus::new());
    let pipeline = Pipeline::start(bus.clone());
    let store = Arc::new(MemoryObjectStore::with_bus(bus));

    store.put_object("A", "x", 15).await;
    store.put_object("A", "y", 10).await;
    store.put_object("A", "plot.png", 4096).await;

    let table = pipeline.table.clone();
    eventually(|| {
        let table = table.clone();
        async move {
            table
                .latest("A")
                .await
                .unwrap()
                .is_some_and(|r| r.cumulative_bytes == 25 && r.object_count == 2)
        }
    })
    .await;

    let report = Remediator::new(store.clone(), RemediationStrategy::DeleteAll, TrackingConfig::default())
        .remediate("A")
        .await
        .unwrap();
    assert_eq!(report.deleted.len(), 2);
    assert_eq!(store.object_count("A"), 1);

    eventually(|| {
        let table = table.clone();
        async move {
            table
                .latest("A")
                .await
                .unwrap()
                .is_some_and(|r| r.cumulative_bytes == 0 && r.object_count == 0)
        }
    })
    .await;

    assert_eq!(table.peak_bytes("A").await.unwrap(), Some(25));
    pipeline.stop().await;
}
