// Sync Worker Configuration
//
// Loaded from environment variables or built in code. The feature toggle is
// a plain field so several independently configured workers can coexist.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::event::DedupConfig;
use crate::reliability::{duration_millis, RetryPolicy};
use crate::sync::StateSyncConfig;

/// Agent kind recorded for streams subscribed without one
pub const DEFAULT_AGENT_KIND: &str = "founder-buddy";

/// Configuration for [`SyncWorker`](super::SyncWorker)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWorkerConfig {
    /// Whether the worker may start at all
    pub enabled: bool,

    /// Pause between polling passes
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How often the connection supervisor checks the connection
    #[serde(with = "duration_millis")]
    pub supervise_interval: Duration,

    /// How long `stop` waits for background loops before aborting them
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Bound of the channel between transport and processor
    pub intake_capacity: usize,

    /// Events kept after their last failed delivery
    pub dead_letter_capacity: usize,

    /// Agent kind used when a subscription names none
    pub default_agent: String,

    /// Redelivery schedule for failed applies
    pub redelivery: RetryPolicy,

    pub dedup: DedupConfig,

    pub sync: StateSyncConfig,

    /// Endpoint, credentials and tables; never serialized
    #[serde(skip)]
    pub connection: ConnectionConfig,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_millis(100),
            supervise_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            intake_capacity: 1024,
            dead_letter_capacity: 1000,
            default_agent: DEFAULT_AGENT_KIND.to_string(),
            redelivery: RetryPolicy::redelivery(),
            dedup: DedupConfig::default(),
            sync: StateSyncConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl SyncWorkerConfig {
    /// Create an enabled configuration for a connection
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            enabled: true,
            connection,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `REALTIME_SYNC_ENABLED`: Enable the worker (default: false)
    /// - `SUPABASE_URL` / `SUPABASE_ANON_KEY`: Connection credentials
    /// - `REALTIME_POLL_INTERVAL_MS`: Polling pause (default: 100)
    /// - `REALTIME_INTAKE_CAPACITY`: Intake channel bound (default: 1024)
    /// - `REALTIME_DEDUP_TTL_SECS`: How long event ids are remembered (default: 3600)
    /// - `REALTIME_DEDUP_MAX_ENTRIES`: Cap on remembered ids (default: 100000)
    /// - `REALTIME_DEAD_LETTER_CAPACITY`: Dead letters kept (default: 1000)
    /// - `REALTIME_DEFAULT_AGENT`: Default agent kind (default: founder-buddy)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = env::var("REALTIME_SYNC_ENABLED")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval = env_parse("REALTIME_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let intake_capacity =
            env_parse("REALTIME_INTAKE_CAPACITY").unwrap_or(defaults.intake_capacity);

        let mut dedup = defaults.dedup.clone();
        if let Some(secs) = env_parse("REALTIME_DEDUP_TTL_SECS") {
            dedup = dedup.with_ttl(Duration::from_secs(secs));
        }
        if let Some(max) = env_parse("REALTIME_DEDUP_MAX_ENTRIES") {
            dedup = dedup.with_max_entries(max);
        }

        let dead_letter_capacity =
            env_parse("REALTIME_DEAD_LETTER_CAPACITY").unwrap_or(defaults.dead_letter_capacity);

        let default_agent = env::var("REALTIME_DEFAULT_AGENT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.default_agent.clone());

        Self {
            enabled,
            poll_interval,
            intake_capacity: intake_capacity.max(1),
            dead_letter_capacity,
            default_agent,
            dedup,
            connection: ConnectionConfig::from_env(),
            ..defaults
        }
    }

    /// Turn the worker on or off
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the polling pause
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the supervisor interval
    pub fn with_supervise_interval(mut self, interval: Duration) -> Self {
        self.supervise_interval = interval;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the intake channel bound
    pub fn with_intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = capacity.max(1);
        self
    }

    /// Set the dead letter capacity
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Set the default agent kind
    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = agent.into();
        self
    }

    /// Set the redelivery schedule
    pub fn with_redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Set the dedup configuration
    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    /// Set the state sync configuration
    pub fn with_sync(mut self, sync: StateSyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disabled() {
        let config = SyncWorkerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.default_agent, "founder-buddy");
        assert_eq!(config.redelivery, RetryPolicy::redelivery());
    }

    #[test]
    fn test_new_is_enabled() {
        let config = SyncWorkerConfig::new(ConnectionConfig::new("https://x.supabase.co", "k"))
            .with_intake_capacity(0)
            .with_poll_interval(Duration::from_millis(5));

        assert!(config.enabled);
        assert_eq!(config.intake_capacity, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert!(config.connection.has_credentials());
    }

    #[test]
    fn test_serde_skips_connection() {
        let config = SyncWorkerConfig::new(ConnectionConfig::new("https://x.supabase.co", "secret"));
        let json = serde_json::to_value(&config).unwrap();

        assert!(json.get("connection").is_none());
        assert_eq!(json["poll_interval"], 100);

        let back: SyncWorkerConfig = serde_json::from_value(json).unwrap();
        assert!(back.enabled);
        assert!(!back.connection.has_credentials());
    }
}
