//! Centralized engine configuration.
//!
//! Loaded once at start via the `config` crate from environment variables.
//! Nested sections use `__` as separator, e.g. `NATS__URL` or
//! `SCHEDULER__POLL_INTERVAL_SECONDS`.

use runwright_scheduler::SchedulerConfig;
use runwright_trigger::PollerConfig;
use runwright_workflow::NatsConfig;
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration composed from the component configs.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Size of the database connection pool.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis URL of the shared cache.
    pub redis_url: String,

    /// Task queue configuration.
    pub nats: NatsSettings,

    /// Lock and claim lifetimes.
    #[serde(default)]
    pub locks: LockSettings,

    /// Schedule polling.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// External event polling.
    #[serde(default)]
    pub pollers: PollerSettings,
}

/// NATS JetStream settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    /// NATS server URL.
    pub url: String,

    /// Stream capturing the task subjects.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Durable consumer the executors share.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Deliveries handled concurrently by one engine process.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl NatsSettings {
    /// Builds the queue client configuration.
    #[must_use]
    pub fn queue_config(&self) -> NatsConfig {
        NatsConfig {
            url: self.url.clone(),
            stream_name: Some(self.stream.clone()),
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Lock and claim lifetimes, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    /// Lifetime of the per-(workflow, user) run lock.
    #[serde(default = "default_run_lock_ttl_seconds")]
    pub run_lock_ttl_seconds: u64,

    /// Lifetime of an event claim without a time window of its own.
    #[serde(default = "default_event_claim_ttl_seconds")]
    pub event_claim_ttl_seconds: u64,

    /// Expiry of a run's running-node set.
    #[serde(default = "default_running_set_ttl_seconds")]
    pub running_set_ttl_seconds: u64,
}

impl LockSettings {
    #[must_use]
    pub fn run_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.run_lock_ttl_seconds)
    }

    #[must_use]
    pub fn event_claim_ttl(&self) -> Duration {
        Duration::from_secs(self.event_claim_ttl_seconds)
    }

    #[must_use]
    pub fn running_set_ttl(&self) -> Duration {
        Duration::from_secs(self.running_set_ttl_seconds)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            run_lock_ttl_seconds: default_run_lock_ttl_seconds(),
            event_claim_ttl_seconds: default_event_claim_ttl_seconds(),
            running_set_ttl_seconds: default_running_set_ttl_seconds(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between polls for due schedules.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Maximum schedules claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds after which a claimed but unfinished dispatch is retried.
    #[serde(default = "default_claim_timeout_seconds")]
    pub claim_timeout_seconds: u64,
}

impl SchedulerSettings {
    /// Builds the scheduler configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            batch_size: self.batch_size,
            claim_timeout: Duration::from_secs(self.claim_timeout_seconds),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            batch_size: default_batch_size(),
            claim_timeout_seconds: default_claim_timeout_seconds(),
        }
    }
}

/// Event poller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerSettings {
    /// Seconds between poll cycles of each event source.
    #[serde(default = "default_event_poll_interval_seconds")]
    pub interval_seconds: u64,
}

impl PollerSettings {
    /// Builds the poller configuration. Claims without a window of their own
    /// live for `event_claim_ttl`.
    #[must_use]
    pub fn poller_config(&self, locks: &LockSettings) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.interval_seconds),
            claim_fallback_ttl: locks.event_claim_ttl(),
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_event_poll_interval_seconds(),
        }
    }
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_stream() -> String {
    "WORKFLOW_TASKS".to_string()
}

fn default_queue() -> String {
    runwright_workflow::task::NODE_EXECUTION_QUEUE.to_string()
}

fn default_max_in_flight() -> usize {
    16
}

fn default_run_lock_ttl_seconds() -> u64 {
    60
}

fn default_event_claim_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_running_set_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_claim_timeout_seconds() -> u64 {
    600
}

fn default_event_poll_interval_seconds() -> u64 {
    60
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
