//! Worker configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::keys;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Per-resource concurrency caps shared by all runs on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Parallel runs on this worker.
    pub runs: usize,
    /// Codec subprocesses extracting audio.
    pub audio_extraction: usize,
    /// In-flight transcription calls.
    pub transcription: usize,
    /// In-flight moment-generation calls.
    pub moment_generation: usize,
    /// Parallel clip codec subprocesses.
    pub clip_extraction: usize,
    /// Refinement calls; the refinement model is strictly serialized.
    pub refinement: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            runs: 2,
            audio_extraction: 2,
            transcription: 2,
            moment_generation: 2,
            clip_extraction: 4,
            refinement: 1,
        }
    }
}

impl ConcurrencyLimits {
    pub fn validate(&self) -> ConfigResult<()> {
        let caps = [
            ("runs", self.runs),
            ("audio_extraction", self.audio_extraction),
            ("transcription", self.transcription),
            ("moment_generation", self.moment_generation),
            ("clip_extraction", self.clip_extraction),
            ("refinement", self.refinement),
        ];
        for (name, cap) in caps {
            if cap == 0 {
                return Err(ConfigError::Invalid(format!(
                    "concurrency limit '{name}' must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Timeouts for calls made through tunnels.
#[derive(Debug, Clone)]
pub struct InferenceTimeouts {
    pub chat: Duration,
    pub transcription: Duration,
    pub connect: Duration,
    /// Backoff before the single transport-level retry.
    pub retry_backoff: Duration,
}

impl Default for InferenceTimeouts {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(600),
            transcription: Duration::from_secs(1800),
            connect: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Tunnel establishment parameters.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Total time to wait for the forwarded port to accept connections.
    pub ready_timeout: Duration,
    /// Delay between TCP connect probes.
    pub probe_interval: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_millis(500),
        }
    }
}

/// Full worker-process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    /// Stable per-process consumer name, e.g. `worker-host-1234`.
    pub consumer: String,
    pub reclaim_idle: Duration,
    /// Blocking-read window for stream polls.
    pub block: Duration,
    pub lock_ttl: Duration,
    pub cancel_ttl: Duration,
    /// TTL of archived run snapshots.
    pub history_ttl: Duration,
    /// Per-subject history entries kept after archive trimming.
    pub history_max_runs: usize,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
    /// Signed-URL validity requested from the artifact store.
    pub signed_url_ttl: Duration,
    /// Registry key of the transcription service.
    pub transcription_model: String,
    /// Skip stages already completed in the subject's latest archived
    /// run. Off by default.
    pub resume: bool,
    /// Root for per-run scratch directories.
    pub temp_root: std::path::PathBuf,
    pub limits: ConcurrencyLimits,
    pub timeouts: InferenceTimeouts,
    pub tunnel: TunnelSettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream: keys::REQUEST_STREAM.to_string(),
            group: keys::WORKER_GROUP.to_string(),
            consumer: default_consumer_name(),
            reclaim_idle: Duration::from_millis(60_000),
            block: Duration::from_millis(5_000),
            lock_ttl: Duration::from_secs(1_800),
            cancel_ttl: Duration::from_secs(300),
            history_ttl: Duration::from_secs(24 * 60 * 60),
            history_max_runs: 50,
            shutdown_grace: Duration::from_secs(300),
            signed_url_ttl: Duration::from_secs(3_600),
            transcription_model: "parakeet".to_string(),
            resume: false,
            temp_root: std::env::temp_dir().join("moments-pipeline"),
            limits: ConcurrencyLimits::default(),
            timeouts: InferenceTimeouts::default(),
            tunnel: TunnelSettings::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.stream.is_empty() {
            return Err(ConfigError::Invalid("stream key must not be empty".into()));
        }
        if self.group.is_empty() {
            return Err(ConfigError::Invalid("group name must not be empty".into()));
        }
        if self.consumer.is_empty() {
            return Err(ConfigError::Invalid("consumer name must not be empty".into()));
        }
        if self.lock_ttl < Duration::from_secs(10) {
            return Err(ConfigError::Invalid(
                "lock TTL shorter than 10s cannot outlive a stage".into(),
            ));
        }
        if self.reclaim_idle.is_zero() {
            return Err(ConfigError::Invalid(
                "reclaim idle threshold must be positive".into(),
            ));
        }
        self.limits.validate()
    }
}

/// `worker-{host}-{pid}`: stable across restarts of the same container,
/// distinct between hosts.
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("worker-{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn default_limits_match_capacity_table() {
        let limits = ConcurrencyLimits::default();
        assert_eq!(limits.runs, 2);
        assert_eq!(limits.audio_extraction, 2);
        assert_eq!(limits.transcription, 2);
        assert_eq!(limits.moment_generation, 2);
        assert_eq!(limits.clip_extraction, 4);
        assert_eq!(limits.refinement, 1);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut limits = ConcurrencyLimits::default();
        limits.refinement = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn short_lock_ttl_is_rejected() {
        let mut config = WorkerConfig::default();
        config.lock_ttl = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn consumer_name_carries_pid() {
        let name = default_consumer_name();
        assert!(name.starts_with("worker-"));
        assert!(name.ends_with(&std::process::id().to_string()));
    }
}
