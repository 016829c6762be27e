use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use usage_pipeline::{FanoutBus, LifecycleEvent};

/// Errors raised by object store adapters
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Failed to list objects in {store_id}: {message}")]
    ListError { store_id: String, message: String },

    #[error("Failed to delete {store_id}/{key}: {message}")]
    DeleteError {
        store_id: String,
        key: String,
        message: String,
    },
}

/// Key and size of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size_bytes: u64,
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The object was already gone
    NotFound,
}

/// The object store as seen by remediation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object currently in the store
    async fn list_objects(&self, store_id: &str) -> Result<Vec<ObjectSummary>, ObjectStoreError>;

    /// Delete one object
    async fn delete_object(&self, store_id: &str, key: &str)
        -> Result<DeleteOutcome, ObjectStoreError>;
}

/// In-process object store that emits lifecycle events to a bus
#[derive(Default)]
pub struct MemoryObjectStore {
    stores: Mutex<HashMap<String, BTreeMap<String, u64>>>,
    bus: Option<Arc<FanoutBus>>,
}

impl MemoryObjectStore {
    /// A store that emits no events
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes every change to `bus`
    pub fn with_bus(bus: Arc<FanoutBus>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            bus: Some(bus),
        }
    }

    /// Write an object; overwriting emits a removal of the old version first
    pub async fn put_object(&self, store_id: &str, key: &str, size_bytes: u64) {
        let previous = self
            .stores
            .lock()
            .entry(store_id.to_string())
            .or_default()
            .insert(key.to_string(), size_bytes);

        if let Some(old_size) = previous {
            self.emit(LifecycleEvent::removed(store_id, key, old_size))
                .await;
        }
        self.emit(LifecycleEvent::created(store_id, key, size_bytes))
            .await;
    }

    /// Sum of object sizes currently in a store
    pub fn total_bytes(&self, store_id: &str) -> u64 {
        self.stores
            .lock()
            .get(store_id)
            .map(|objects| objects.values().sum())
            .unwrap_or(0)
    }

    /// Number of objects currently in a store
    pub fn object_count(&self, store_id: &str) -> usize {
        self.stores
            .lock()
            .get(store_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    async fn emit(&self, event: LifecycleEvent) {
        let Some(bus) = &self.bus else {
            return;
        };

        let report = bus.publish(&event).await;
        if !report.is_complete() {
            warn!(
                store_id = %event.store_id,
                object_key = %event.object_key,
                failed = report.failed.len(),
                "Lifecycle event not delivered to every subscriber"
            );
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(&self, store_id: &str) -> Result<Vec<ObjectSummary>, ObjectStoreError> {
        Ok(self
            .stores
            .lock()
            .get(store_id)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(key, size)| ObjectSummary {
                        key: key.clone(),
                        size_bytes: *size,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_object(
        &self,
        store_id: &str,
        key: &str,
    ) -> Result<DeleteOutcome, ObjectStoreError> {
        let removed = self
            .stores
            .lock()
            .get_mut(store_id)
            .and_then(|objects| objects.remove(key));

        match removed {
            Some(size) => {
                self.emit(LifecycleEvent::removed(store_id, key, size)).await;
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}

/// S3-backed object store; each store id is a bucket
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store client
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Ok(Self { client })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, ObjectStoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::DeleteError {
                        store_id: bucket.to_string(),
                        key: key.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_objects(&self, store_id: &str) -> Result<Vec<ObjectSummary>, ObjectStoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(store_id)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| ObjectStoreError::ListError {
                store_id: store_id.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

            objects.extend(page.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size_bytes: obj.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                })
            }));
        }

        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn delete_object(
        &self,
        store_id: &str,
        key: &str,
    ) -> Result<DeleteOutcome, ObjectStoreError> {
        // S3 deletes are silent for missing keys
        if !self.exists(store_id, key).await? {
            return Ok(DeleteOutcome::NotFound);
        }

        self.client
            .delete_object()
            .bucket(store_id)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::DeleteError {
                store_id: store_id.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!("Object deleted from S3");
        Ok(DeleteOutcome::Deleted)
    }
}
