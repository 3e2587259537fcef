use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::retry::RetryDelayMode;

/// Dialer engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// General engine settings
    pub general: GeneralConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Dial scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Call lifecycle tracker configuration
    pub tracker: TrackerConfig,

    /// Retry planner configuration
    pub retry: RetryConfig,

    /// Manual/test call gateway configuration
    pub gateway: GatewayConfig,

    /// Telephony provider configuration
    pub provider: ProviderConfig,

    /// HTTP API configuration
    pub api: ApiConfig,

    /// Monitoring configuration
    pub monitoring: MonitoringConfig,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// General engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name reported in logs and the health endpoint
    pub service_name: String,

    /// Hard upper bound for a campaign's `pacing.max_concurrent`
    pub max_concurrent_ceiling: u32,

    /// Account-wide ceiling on simultaneous calls (scheduled, test and manual)
    pub account_max_concurrent: u32,

    /// How often this instance renews its lease on the shared database (ms)
    pub heartbeat_interval_ms: u64,

    /// Lease age after which an instance's in-flight calls are recovered by its peers (ms)
    pub instance_lease_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL, e.g. `sqlite://dialer.db` or `sqlite::memory:`
    pub url: String,

    /// Maximum pooled connections
    pub max_connections: u32,

    /// SQLite busy timeout (seconds)
    pub busy_timeout_secs: u64,
}

/// Dial scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on how long a campaign loop sleeps between ticks (ms)
    pub poll_interval_ms: u64,

    /// Cooldown applied to a lead whose origination was rejected (seconds)
    pub dial_failure_cooldown_secs: u64,

    /// Consecutive origination rejections before the rejection counts as a failed attempt
    pub max_dial_failures: u32,

    /// Number of candidate leads fetched per selection page
    pub candidate_batch: u32,

    /// Token bucket burst size for pacing
    pub pacing_burst: u32,

    /// Initial backoff after a store error inside a campaign loop (ms)
    pub error_backoff_initial_ms: u64,

    /// Maximum backoff after repeated store errors (ms)
    pub error_backoff_max_ms: u64,
}

/// Call lifecycle tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Silence before the tracker polls the provider for status (ms)
    pub status_poll_interval_ms: u64,

    /// Silence before an attempt is declared failed (ms)
    pub status_timeout_ms: u64,

    /// Whether an answering machine counts as a completed contact
    pub machine_is_contact: bool,

    /// How long early provider events wait for their session to register (seconds)
    pub pending_event_ttl_secs: u64,

    /// First delay before retrying a failed lead finalization (ms)
    pub finalize_retry_initial_ms: u64,

    /// Cap on the finalization retry delay (ms)
    pub finalize_retry_max_ms: u64,
}

/// Retry planner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How delays are picked when attempts outrun `retry_after_minutes`
    pub delay_mode: RetryDelayMode,
}

/// Manual/test call gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Caller ID used for manual calls
    pub default_caller_id: Option<String>,
}

/// Telephony provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process simulated provider
    #[default]
    Simulated,
    /// JSON over HTTP provider
    Http,
}

/// Telephony provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Which provider implementation to use
    pub kind: ProviderKind,

    /// Base URL of the HTTP provider
    pub base_url: Option<String>,

    /// Bearer token for the HTTP provider
    pub api_key: Option<String>,

    /// HTTP request timeout (ms)
    pub request_timeout_ms: u64,

    /// Simulated provider call script
    pub simulation: SimulationConfig,
}

/// Scripted progress for the simulated provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Push status events automatically after origination
    pub auto_progress: bool,

    /// Delay before `ringing` (ms)
    pub ring_after_ms: u64,

    /// Delay from ringing to `answered` (ms)
    pub answer_after_ms: u64,

    /// Delay from answered to `completed` (ms)
    pub complete_after_ms: u64,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve the HTTP API
    pub enabled: bool,

    /// Bind address
    pub bind_address: String,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Interval between status log lines (seconds)
    pub status_log_interval_secs: u64,

    /// Capacity of the engine event broadcast channel
    pub event_channel_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Include file and line in log lines
    pub file_info: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: "dialer-engine".to_string(),
            max_concurrent_ceiling: 100,
            account_max_concurrent: 50,
            heartbeat_interval_ms: 10_000,
            instance_lease_ms: 30_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://dialer.db".to_string(),
            max_connections: 8,
            busy_timeout_secs: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            dial_failure_cooldown_secs: 30,
            max_dial_failures: 3,
            candidate_batch: 25,
            pacing_burst: 1,
            error_backoff_initial_ms: 500,
            error_backoff_max_ms: 30_000,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 15_000,
            status_timeout_ms: 180_000, // 3 minutes
            machine_is_contact: false,
            pending_event_ttl_secs: 60,
            finalize_retry_initial_ms: 100,
            finalize_retry_max_ms: 10_000,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Simulated,
            base_url: None,
            api_key: None,
            request_timeout_ms: 10_000,
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            auto_progress: false,
            ring_after_ms: 500,
            answer_after_ms: 2_000,
            complete_after_ms: 20_000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8090".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            status_log_interval_secs: 30,
            event_channel_capacity: 1024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dial_failure_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dial_failure_cooldown_secs as i64)
    }
}

impl TrackerConfig {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn finalize_retry_initial(&self) -> Duration {
        Duration::from_millis(self.finalize_retry_initial_ms)
    }

    pub fn finalize_retry_max(&self) -> Duration {
        Duration::from_millis(self.finalize_retry_max_ms)
    }
}

impl GeneralConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn instance_lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.instance_lease_ms as i64)
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file layered under
    /// `DIALER__`-prefixed environment variables
    /// (e.g. `DIALER__SCHEDULER__POLL_INTERVAL_MS=250`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DIALER")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::configuration(format!("failed to load configuration: {}", e)))?;

        config.validate().map_err(EngineError::configuration)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general.max_concurrent_ceiling == 0 {
            return Err("max_concurrent_ceiling must be greater than 0".to_string());
        }

        if self.general.account_max_concurrent == 0 {
            return Err("account_max_concurrent must be greater than 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("database url cannot be empty".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("database max_connections must be greater than 0".to_string());
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        if self.scheduler.max_dial_failures == 0 {
            return Err("max_dial_failures must be greater than 0".to_string());
        }

        if self.scheduler.candidate_batch == 0 {
            return Err("candidate_batch must be greater than 0".to_string());
        }

        if self.scheduler.pacing_burst == 0 {
            return Err("pacing_burst must be greater than 0".to_string());
        }

        if self.scheduler.error_backoff_initial_ms > self.scheduler.error_backoff_max_ms {
            return Err("error_backoff_initial_ms cannot exceed error_backoff_max_ms".to_string());
        }

        if self.tracker.status_poll_interval_ms == 0 || self.tracker.status_timeout_ms == 0 {
            return Err("tracker intervals must be greater than 0".to_string());
        }

        if self.tracker.status_poll_interval_ms > self.tracker.status_timeout_ms {
            return Err("status_poll_interval_ms cannot exceed status_timeout_ms".to_string());
        }

        if self.tracker.finalize_retry_initial_ms == 0
            || self.tracker.finalize_retry_initial_ms > self.tracker.finalize_retry_max_ms
        {
            return Err("finalize_retry_initial_ms must be in 1..=finalize_retry_max_ms".to_string());
        }

        if self.general.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".to_string());
        }

        // a live instance must renew at least twice per lease
        if self.general.instance_lease_ms < self.general.heartbeat_interval_ms * 2 {
            return Err("instance_lease_ms must be at least twice heartbeat_interval_ms".to_string());
        }

        if self.provider.kind == ProviderKind::Http && self.provider.base_url.is_none() {
            return Err("provider base_url is required for the http provider".to_string());
        }

        if self.monitoring.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}
