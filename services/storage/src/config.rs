use serde::Deserialize;
use std::time::Duration;
use usage_pipeline::QueueConfig;

/// Main configuration for the storage monitor
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Work queue and worker pool configuration, shared by both consumers
    #[serde(default)]
    pub queue: QueueConfig,
    /// Database configuration; in-memory backends are used when absent
    pub database: Option<DatabaseConfig>,
    /// S3 configuration; an in-memory object store is used when absent
    pub s3: Option<S3Config>,
    /// Threshold alarm configuration
    pub alarm: AlarmConfig,
    /// Remediation configuration
    #[serde(default)]
    pub remediation: RemediationConfig,
    /// Usage tracking configuration
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Read newline-delimited notifications from stdin and publish them
    #[serde(default)]
    pub ingest_stdin: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// S3 object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Threshold alarm configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfig {
    /// Store whose deltas are aggregated and whose objects are remediated
    pub store_id: String,
    /// Windowed delta sum above which a window breaches
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: i64,
    /// Consecutive breaching windows needed to enter ALARM
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,
    /// Window length in seconds
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Seconds after a window ends before it is evaluated
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Recent readings kept for inspection
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// What remediation deletes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStrategy {
    /// Every object in the store
    #[default]
    DeleteAll,
    /// Only the single largest object
    DeleteLargest,
}

/// Remediation configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemediationConfig {
    #[serde(default)]
    pub strategy: RemediationStrategy,
}

/// Usage tracking configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Skip events already applied to the usage table
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    /// Object keys excluded from tracking and remediation
    #[serde(default = "default_ignored_keys")]
    pub ignored_keys: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "storage-monitor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_threshold_bytes() -> i64 {
    20
}

fn default_evaluation_periods() -> u32 {
    1
}

fn default_period_secs() -> u64 {
    60
}

fn default_settle_secs() -> u64 {
    10
}

fn default_history_len() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_ignored_keys() -> Vec<String> {
    // The chart collaborator writes its rendering back into the store
    vec!["plot".to_string(), "plot.png".to_string()]
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "storage-monitor")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/monitor").required(false))
            .add_source(config::File::with_name("/etc/storage-monitor/monitor").required(false))
            // Override with environment variables
            // MONITOR__ALARM__STORE_ID -> alarm.store_id
            .add_source(
                config::Environment::with_prefix("MONITOR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("tracking.ignored_keys"),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the alarm evaluation window as Duration
    pub fn alarm_period(&self) -> Duration {
        Duration::from_secs(self.alarm.period_secs)
    }

    /// Get the delay between a window's end and its evaluation as Duration
    pub fn alarm_settle(&self) -> Duration {
        Duration::from_secs(self.alarm.settle_secs)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl AlarmConfig {
    /// Alarm for `store_id` with default threshold and timing
    pub fn for_store(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            threshold_bytes: default_threshold_bytes(),
            evaluation_periods: default_evaluation_periods(),
            period_secs: default_period_secs(),
            settle_secs: default_settle_secs(),
            history_len: default_history_len(),
        }
    }
}

impl TrackingConfig {
    /// True if events for this key are never tracked or remediated
    pub fn is_ignored(&self, object_key: &str) -> bool {
        self.ignored_keys.iter().any(|k| k == object_key)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            ingest_stdin: false,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            ignored_keys: default_ignored_keys(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_threshold_bytes(), 20);
        assert_eq!(default_evaluation_periods(), 1);
        assert_eq!(RemediationStrategy::default(), RemediationStrategy::DeleteAll);
        assert!(TrackingConfig::default().dedup_enabled);
    }

    #[test]
    fn test_ignored_keys() {
        let tracking = TrackingConfig::default();
        assert!(tracking.is_ignored("plot"));
        assert!(tracking.is_ignored("plot.png"));
        assert!(!tracking.is_ignored("plots/plot.png"));
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_override("alarm.store_id", "store-a")
            .unwrap()
            .set_override("remediation.strategy", "delete_largest")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.alarm.store_id, "store-a");
        assert_eq!(config.alarm.threshold_bytes, 20);
        assert_eq!(config.alarm_settle(), Duration::from_secs(10));
        assert_eq!(config.remediation.strategy, RemediationStrategy::DeleteLargest);
        assert_eq!(config.queue.max_receive_count, 3);
        assert!(config.database.is_none());
        assert!(config.s3.is_none());
        assert_eq!(config.service.name, "storage-monitor");
    }
}
