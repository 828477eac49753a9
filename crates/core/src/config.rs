use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__`, layered over an optional config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            idempotency: IdempotencyConfig::default(),
            persistence: PersistenceConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Number of independent scan workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of due enrollments a worker picks up per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claimed enrollment stays invisible to other workers.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_scheduler_enabled() -> bool { true }
fn default_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_batch_size() -> usize { 500 }
fn default_lease_secs() -> u64 { 60 }
fn default_send_timeout_ms() -> u64 { 10_000 }
fn default_maintenance_interval_secs() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff policy for transient Channel Sender failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total send attempts (first try included) before the enrollment fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 { 4 }
fn default_initial_backoff_secs() -> u64 { 60 }
fn default_max_backoff_secs() -> u64 { 3600 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// ─── Rate Limit Config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Days of per-sequence counters kept for audit before purging.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 { 7 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

// ─── Idempotency Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_idempotency_max_entries")]
    pub max_entries: usize,
}

fn default_idempotency_ttl_secs() -> u64 { 86_400 }
fn default_idempotency_max_entries() -> usize { 100_000 }

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_idempotency_ttl_secs(),
            max_entries: default_idempotency_max_entries(),
        }
    }
}

// ─── Persistence Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// JSON snapshot file. Persistence is disabled when unset.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_snapshot_interval_secs() -> u64 { 30 }

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

// ─── Channels Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_tracking")]
    pub open_tracking: bool,
    #[serde(default = "default_tracking")]
    pub click_tracking: bool,
}

fn default_from_email() -> String { "outreach@example.com".to_string() }
fn default_from_name() -> String { "Outreach".to_string() }
fn default_tracking() -> bool { true }

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            open_tracking: default_tracking(),
            click_tracking: default_tracking(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional file, overridden by environment
    /// variables (`OUTREACH__SCHEDULER__WORKERS=8`).
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert!(config.scheduler.enabled);
        assert!(config.scheduler.workers > 0);
        assert!(config.scheduler.retry.max_attempts > 1);
        assert!(config.persistence.snapshot_path.is_none());
    }

    #[test]
    fn test_empty_source_uses_serde_defaults() {
        let config: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.node_id, "node-01");
        assert_eq!(config.scheduler.batch_size, 500);
        assert_eq!(config.idempotency.ttl_secs, 86_400);
        assert_eq!(config.rate_limit.retention_days, 7);
    }

    #[test]
    fn test_nested_override() {
        let config: AppConfig = config::Config::builder()
            .set_override("scheduler.workers", 9)
            .unwrap()
            .set_override("scheduler.retry.max_attempts", 2)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.scheduler.workers, 9);
        assert_eq!(config.scheduler.retry.max_attempts, 2);
        assert_eq!(config.scheduler.lease_secs, 60);
    }
}
