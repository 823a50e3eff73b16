//! Configuration types.

use std::time::Duration;

use crate::completion::CompletionPolicy;
use crate::error::ConfigError;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Maximum heartbeat age for an agent to count as alive.
    pub liveness_window: Duration,
    /// How often each worker runtime emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// Delay between broker reconnection attempts.
    pub reconnect_backoff: Duration,
    /// Tasks stuck in `assigned` longer than this are reset to `pending`
    /// on the next dispatch trigger.
    pub stuck_assigned_threshold: Duration,
    /// When a project counts as complete.
    pub completion_policy: CompletionPolicy,
    /// Number of in-process worker runtimes to spawn.
    pub worker_count: usize,
    /// HTTP port for the management API.
    pub http_port: u16,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/taskmesh.db".to_string(),
            liveness_window: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
            stuck_assigned_threshold: Duration::from_secs(300), // 5 minutes
            completion_policy: CompletionPolicy::CompletedOrFailed,
            worker_count: 2,
            http_port: 5000,
        }
    }
}

impl MeshConfig {
    /// Build a config from environment variables, falling back to defaults.
    /// An unset variable takes its default; a set-but-invalid one is an
    /// error, not a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            db_path: std::env::var("TASKMESH_DB_PATH").unwrap_or(defaults.db_path),
            liveness_window: env_secs("TASKMESH_LIVENESS_WINDOW_SECS", defaults.liveness_window)?,
            heartbeat_interval: env_secs(
                "TASKMESH_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            reconnect_backoff: env_secs(
                "TASKMESH_RECONNECT_BACKOFF_SECS",
                defaults.reconnect_backoff,
            )?,
            stuck_assigned_threshold: env_secs(
                "TASKMESH_STUCK_ASSIGNED_SECS",
                defaults.stuck_assigned_threshold,
            )?,
            completion_policy: match std::env::var("TASKMESH_COMPLETION_POLICY") {
                Ok(s) => s.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "TASKMESH_COMPLETION_POLICY".to_string(),
                    message,
                })?,
                Err(_) => defaults.completion_policy,
            },
            worker_count: env_parse("TASKMESH_WORKERS", defaults.worker_count)?,
            http_port: env_parse("TASKMESH_HTTP_PORT", defaults.http_port)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {s:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(
        key,
        default.as_secs(),
    )?))
}
