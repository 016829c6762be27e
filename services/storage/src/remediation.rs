use crate::alarm::AlarmTransition;
use crate::config::{RemediationStrategy, TrackingConfig};
use crate::object_store::{DeleteOutcome, ObjectStore, ObjectStoreError, ObjectSummary};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What a remediation run removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub store_id: String,
    /// Keys deleted by this run
    pub deleted: Vec<String>,
    /// Keys that were already gone when deleted
    pub already_absent: Vec<String>,
    pub bytes_reclaimed: u64,
}

/// Deletes objects from a store whose alarm activated
pub struct Remediator {
    store: Arc<dyn ObjectStore>,
    strategy: RemediationStrategy,
    tracking: TrackingConfig,
}

impl Remediator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        strategy: RemediationStrategy,
        tracking: TrackingConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            tracking,
        }
    }

    /// Delete the store's objects according to the configured strategy.
    ///
    /// Safe to repeat: objects already gone count as handled.
    #[instrument(skip(self), fields(strategy = ?self.strategy))]
    pub async fn remediate(&self, store_id: &str) -> Result<RemediationReport, ObjectStoreError> {
        let objects: Vec<ObjectSummary> = self
            .store
            .list_objects(store_id)
            .await?
            .into_iter()
            .filter(|o| !self.tracking.is_ignored(&o.key))
            .collect();

        let targets = match self.strategy {
            RemediationStrategy::DeleteAll => objects,
            RemediationStrategy::DeleteLargest => {
                objects.into_iter().max_by_key(|o| o.size_bytes).into_iter().collect()
            }
        };

        let mut report = RemediationReport {
            store_id: store_id.to_string(),
            ..Default::default()
        };

        if targets.is_empty() {
            info!("Store is empty, nothing to remediate");
            return Ok(report);
        }

        for object in targets {
            match self.store.delete_object(store_id, &object.key).await? {
                DeleteOutcome::Deleted => {
                    debug!(key = %object.key, size_bytes = object.size_bytes, "Object deleted");
                    report.bytes_reclaimed += object.size_bytes;
                    report.deleted.push(object.key);
                }
                DeleteOutcome::NotFound => {
                    debug!(key = %object.key, "Object already deleted");
                    report.already_absent.push(object.key);
                }
            }
        }

        metrics::counter!("monitor.remediation.deleted_objects").increment(report.deleted.len() as u64);
        info!(
            deleted = report.deleted.len(),
            already_absent = report.already_absent.len(),
            bytes_reclaimed = report.bytes_reclaimed,
            "Remediation complete"
        );

        Ok(report)
    }

    /// Remediate on every alarm activation until shutdown or the channel closes
    pub async fn run(
        &self,
        mut transitions: broadcast::Receiver<AlarmTransition>,
        shutdown: CancellationToken,
    ) {
        info!("Remediation subscriber started");

        loop {
            let transition = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = transitions.recv() => match received {
                    Ok(transition) => transition,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Remediation subscriber lagged behind alarm transitions");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if !transition.is_activation() {
                continue;
            }

            metrics::counter!("monitor.remediation.runs").increment(1);
            if let Err(e) = self.remediate(&transition.store_id).await {
                error!(store_id = %transition.store_id, error = %e, "Remediation failed");
                metrics::counter!("monitor.remediation.failures").increment(1);
            }
        }

        info!("Remediation subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmState;
    use crate::object_store::{MemoryObjectStore, MockObjectStore};
    use chrono::Utc;

    fn summary(key: &str, size: u64) -> ObjectSummary {
        ObjectSummary {
            key: key.to_string(),
            size_bytes: size,
        }
    }

    fn remediator(store: Arc<dyn ObjectStore>, strategy: RemediationStrategy) -> Remediator {
        Remediator::new(store, strategy, TrackingConfig::default())
    }

    fn transition(from: AlarmState, to: AlarmState) -> AlarmTransition {
        AlarmTransition {
            store_id: "A".to_string(),
            from,
            to,
            reading: Some(25),
            window_start: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delete_all_skips_ignored_keys() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put_object("A", "x", 15).await;
        store.put_object("A", "y", 10).await;
        store.put_object("A", "plot.png", 4096).await;

        let report = remediator(store.clone(), RemediationStrategy::DeleteAll)
            .remediate("A")
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(report.bytes_reclaimed, 25);
        assert_eq!(store.object_count("A"), 1);
    }

    #[tokio::test]
    async fn test_empty_store_twice() {
        let store = Arc::new(MemoryObjectStore::new());
        let remediator = remediator(store, RemediationStrategy::DeleteAll);

        for _ in 0..2 {
            let report = remediator.remediate("A").await.unwrap();
            assert!(report.deleted.is_empty());
            assert!(report.already_absent.is_empty());
        }
    }

    #[tokio::test]
    async fn test_delete_largest_only() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .returning(|_| Ok(vec![summary("small", 3), summary("large", 47), summary("mid", 19)]));
        store
            .expect_delete_object()
            .withf(|store_id: &str, key: &str| store_id == "A" && key == "large")
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));

        let report = remediator(Arc::new(store), RemediationStrategy::DeleteLargest)
            .remediate("A")
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["large".to_string()]);
        assert_eq!(report.bytes_reclaimed, 47);
    }

    #[tokio::test]
    async fn test_not_found_counts_as_success() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .returning(|_| Ok(vec![summary("x", 15), summary("y", 10)]));
        store
            .expect_delete_object()
            .times(2)
            .returning(|_, key| {
                if key == "x" {
                    Ok(DeleteOutcome::NotFound)
                } else {
                    Ok(DeleteOutcome::Deleted)
                }
            });

        let report = remediator(Arc::new(store), RemediationStrategy::DeleteAll)
            .remediate("A")
            .await
            .unwrap();

        assert_eq!(report.already_absent, vec!["x".to_string()]);
        assert_eq!(report.deleted, vec!["y".to_string()]);
        assert_eq!(report.bytes_reclaimed, 10);
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let mut store = MockObjectStore::new();
        store.expect_list_objects().returning(|_| {
            Err(ObjectStoreError::ListError {
                store_id: "A".to_string(),
                message: "access denied".to_string(),
            })
        });
        store.expect_delete_object().never();

        let result = remediator(Arc::new(store), RemediationStrategy::DeleteAll)
            .remediate("A")
            .await;
        assert!(matches!(result, Err(ObjectStoreError::ListError { .. })));
    }

    #[tokio::test]
    async fn test_run_acts_only_on_activation() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put_object("A", "x", 15).await;

        let remediator = Arc::new(remediator(store.clone(), RemediationStrategy::DeleteAll));
        let (sender, receiver) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        let task = {
            let remediator = remediator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { remediator.run(receiver, shutdown).await })
        };

        sender
            .send(transition(AlarmState::InsufficientData, AlarmState::Ok))
            .unwrap();
        drop(sender);
        task.await.unwrap();
        assert_eq!(store.object_count("A"), 1);

        let (sender, receiver) = broadcast::channel(16);
        sender
            .send(transition(AlarmState::Ok, AlarmState::Alarm))
            .unwrap();
        drop(sender);
        remediator.run(receiver, shutdown).await;
        assert_eq!(store.object_count("A"), 0);
    }
}
