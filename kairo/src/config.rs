//! Runtime configuration.
//!
//! Backends are selected here: an absent store URL means the in-memory
//! store/stream pair, an absent queue provider means the in-process
//! timer queue. Every knob has a serde default so partial config files
//! deserialize, and [`RuntimeConfig::from_env`] reads the conventional
//! environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which storage backend holds session state and the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state dies with the process. For dev and tests.
    #[default]
    Memory,
    /// Redis-backed state, history, and streams.
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoreConfig {
    /// Selected backend.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection URL; required when `backend` is `Redis`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Connection pool size for the Redis backend.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,
}

/// Which work-queue implementation dispatches steps.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum QueueConfig {
    /// In-process timer queue. For dev and tests.
    #[default]
    InProcess,
    /// Third-party delayed HTTP dispatcher.
    Http {
        /// Bearer token for the provider.
        token: String,
        /// Provider publish endpoint.
        endpoint: String,
        /// URL of this service's step-execution callback.
        callback_url: String,
    },
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => f.write_str("InProcess"),
            Self::Http {
                endpoint,
                callback_url,
                ..
            } => f
                .debug_struct("Http")
                .field("endpoint", endpoint)
                .field("callback_url", callback_url)
                .finish_non_exhaustive(),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Storage backend selection.
    #[serde(default)]
    pub store: StoreConfig,
    /// Queue implementation selection.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Session state/metadata/history TTL.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Event log TTL.
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,
    /// Approximate maximum events retained per session.
    #[serde(default = "default_event_log_max")]
    pub event_log_max: usize,
    /// Default history slice delivered to late-joining subscribers.
    #[serde(default = "default_history_slice")]
    pub history_slice: usize,
    /// Soft wall-clock budget per step, in milliseconds.
    #[serde(default = "default_step_budget_ms")]
    pub step_budget_ms: u64,
    /// Interval between heartbeat frames on live subscriptions.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_pool_max() -> usize {
    16
}

fn default_session_ttl_secs() -> u64 {
    86_400
}

fn default_event_ttl_secs() -> u64 {
    3_600
}

fn default_event_log_max() -> usize {
    1_000
}

fn default_history_slice() -> usize {
    50
}

fn default_step_budget_ms() -> u64 {
    120_000
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            session_ttl_secs: default_session_ttl_secs(),
            event_ttl_secs: default_event_ttl_secs(),
            event_log_max: default_event_log_max(),
            history_slice: default_history_slice(),
            step_budget_ms: default_step_budget_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from environment variables.
    ///
    /// `KAIRO_STORE_URL` selects the Redis backend; `KAIRO_QUEUE_TOKEN`,
    /// `KAIRO_QUEUE_ENDPOINT` and `KAIRO_QUEUE_CALLBACK_URL` together
    /// select the HTTP queue. TTLs and limits read from
    /// `KAIRO_SESSION_TTL_SECS`, `KAIRO_EVENT_TTL_SECS`,
    /// `KAIRO_EVENT_LOG_MAX`, `KAIRO_HISTORY_SLICE`, and
    /// `KAIRO_STEP_BUDGET_MS`. Anything unset keeps its default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("KAIRO_STORE_URL") {
            config.store.backend = StoreBackend::Redis;
            config.store.url = Some(url);
        }

        if let (Ok(token), Ok(endpoint), Ok(callback_url)) = (
            std::env::var("KAIRO_QUEUE_TOKEN"),
            std::env::var("KAIRO_QUEUE_ENDPOINT"),
            std::env::var("KAIRO_QUEUE_CALLBACK_URL"),
        ) {
            config.queue = QueueConfig::Http {
                token,
                endpoint,
                callback_url,
            };
        }

        if let Some(ttl) = env_parse("KAIRO_SESSION_TTL_SECS") {
            config.session_ttl_secs = ttl;
        }
        if let Some(ttl) = env_parse("KAIRO_EVENT_TTL_SECS") {
            config.event_ttl_secs = ttl;
        }
        if let Some(max) = env_parse("KAIRO_EVENT_LOG_MAX") {
            config.event_log_max = max;
        }
        if let Some(slice) = env_parse("KAIRO_HISTORY_SLICE") {
            config.history_slice = slice;
        }
        if let Some(budget) = env_parse("KAIRO_STEP_BUDGET_MS") {
            config.step_budget_ms = budget;
        }

        config
    }

    /// Session TTL as a [`Duration`].
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Event log TTL as a [`Duration`].
    #[must_use]
    pub const fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }

    /// Per-step wall-clock budget as a [`Duration`].
    #[must_use]
    pub const fn step_budget(&self) -> Duration {
        Duration::from_millis(self.step_budget_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub const fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}
