//! Storage Monitor
//!
//! Storage usage tracking and auto-remediation service. Object lifecycle events
//! are fanned out to two independent consumers: one keeps the authoritative
//! running size of each store, the other writes signed size deltas to an
//! append-only log. Deltas are summed per evaluation window and fed to a
//! threshold alarm; when the alarm activates, the store's objects are deleted.
//!
//! ## Features
//!
//! - **Durable Delivery**: Lease-based work queues (in memory or PostgreSQL)
//!   with redelivery and dead-letter queues
//! - **Idempotent Tracking**: Usage records are compare-and-append and
//!   de-duplicated by event id
//! - **Edge-Triggered Alarm**: Remediation runs once per transition into ALARM
//! - **Pluggable Object Store**: S3 (including MinIO/LocalStack) or in-process
//!
//! ## Architecture
//!
//! ```text
//! Object Store           Fanout Bus            Work Queues (+ DLQ)
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐    ┌──────────────┐
//! │ created /    │─────▶│ publish      │─────▶│ size-        │───▶│ Size         │
//! │ removed      │      │              │      │ tracking     │    │ Tracker      │
//! └──────────────┘      │              │      └──────────────┘    └──────────────┘
//!        ▲              │              │      ┌──────────────┐    ┌──────────────┐
//!        │              │              │─────▶│ usage-       │───▶│ Usage        │
//!        │              └──────────────┘      │ logging      │    │ Logger       │
//!        │                                    └──────────────┘    └──────────────┘
//!        │                                                               │
//!        │                                                               ▼
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐    ┌──────────────┐
//! │ Remediator   │◀─────│ Threshold    │◀─────│ Metric       │◀───│ Delta        │
//! │              │      │ Alarm        │      │ Extractor    │    │ Log          │
//! └──────────────┘      └──────────────┘      └──────────────┘    └──────────────┘
//! ```

pub mod alarm;
pub mod config;
pub mod database;
pub mod delta_log;
pub mod metric;
pub mod monitor;
pub mod object_store;
pub mod pg_queue;
pub mod remediation;
pub mod size_tracker;
pub mod usage_logger;
pub mod usage_store;

pub use alarm::{AlarmEvaluator, AlarmState, AlarmTransition, ThresholdAlarm};
pub use config::{Config, RemediationStrategy, TrackingConfig};
pub use delta_log::{DeltaLog, DeltaLogRecord, MemoryDeltaLog, PgDeltaLog};
pub use metric::MetricExtractor;
pub use monitor::{Backends, Monitor};
pub use object_store::{
    DeleteOutcome, MemoryObjectStore, ObjectStore, ObjectStoreError, ObjectSummary, S3ObjectStore,
};
pub use pg_queue::PgQueue;
pub use remediation::{RemediationReport, Remediator};
pub use size_tracker::SizeTracker;
pub use usage_logger::UsageLogger;
pub use usage_store::{
    AppendOutcome, MemoryUsageTable, ObjectChange, PgUsageTable, StoreError, UsageRecord, UsageTable,
};
