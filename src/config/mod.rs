pub mod types;

pub use types::{
    ConcurrencyLimits, ConfigError, ConfigResult, InferenceTimeouts, TunnelSettings, WorkerConfig,
};
