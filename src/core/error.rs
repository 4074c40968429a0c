//! Error types for the pipeline core.
//!
//! Every failure the orchestrator, stages, or managers can produce is a
//! typed variant here; the enqueue adapter and worker loop are the only
//! places that map these onto external error kinds.

/// Errors raised by the coordination store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("malformed value at {key}: {message}")]
    Malformed { key: String, message: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Command(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pipeline-level errors. Carried as values through stage boundaries,
/// converted to stage state, then aggregated into the run outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("a run is already active for subject {subject_id}")]
    Conflict { subject_id: String },

    #[error("lock lost for subject {subject_id}")]
    LockLost { subject_id: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("tunnel for model {model_key} not ready after {waited_ms}ms")]
    TunnelReadinessTimeout { model_key: String, waited_ms: u64 },

    #[error("local port {port} still in use after reclaim attempt")]
    LocalPortInUse { port: u16 },

    #[error("unparseable inference output: {0}")]
    InferenceParse(String),

    #[error("model not registered: {model_key} (available: {available:?})")]
    ModelNotRegistered {
        model_key: String,
        available: Vec<String>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("recoverable: {0}")]
    Recoverable(String),

    #[error("network error for {context}: {message}")]
    Network { context: String, message: String },

    #[error("media operation failed: {0}")]
    Media(String),

    #[error("coordination store: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// A recoverable error degrades the run to `partial` instead of
    /// failing it outright.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::Recoverable(_))
    }

    /// Short tag recorded in the `{stage}_error` status field.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::LockLost { .. } => "lock_lost",
            PipelineError::Cancelled => "cancelled",
            PipelineError::TunnelReadinessTimeout { .. } => "tunnel_timeout",
            PipelineError::LocalPortInUse { .. } => "port_in_use",
            PipelineError::InferenceParse(_) => "inference_parse",
            PipelineError::ModelNotRegistered { .. } => "model_not_registered",
            PipelineError::Storage(_) => "storage",
            PipelineError::Recoverable(_) => "recoverable",
            PipelineError::Network { .. } => "network",
            PipelineError::Media(_) => "media",
            PipelineError::Store(_) => "store",
            PipelineError::Io(_) => "io",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_subject() {
        let err = PipelineError::Conflict {
            subject_id: "vid-123".to_string(),
        };
        assert_eq!(err.to_string(), "a run is already active for subject vid-123");
    }

    #[test]
    fn tunnel_timeout_display() {
        let err = PipelineError::TunnelReadinessTimeout {
            model_key: "vl".to_string(),
            waited_ms: 30_000,
        };
        assert_eq!(err.to_string(), "tunnel for model vl not ready after 30000ms");
    }

    #[test]
    fn recoverable_classification() {
        assert!(PipelineError::Recoverable("one clip".into()).is_recoverable());
        assert!(!PipelineError::Cancelled.is_recoverable());
        assert!(!PipelineError::Storage("boom".into()).is_recoverable());
    }

    #[test]
    fn store_error_converts() {
        let err: PipelineError = StoreError::Command("READONLY".into()).into();
        assert_eq!(err.kind(), "store");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<StoreError>();
    }

    #[test]
    fn network_error_display_carries_context() {
        let err = PipelineError::Network {
            context: "http://127.0.0.1:6106/transcribe".into(),
            message: "connection refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/transcribe"));
        assert!(text.contains("connection refused"));
    }
}
