use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use moments_pipeline::{
    app_context::PipelineContext,
    config::WorkerConfig,
    data_connector::{CoordStore, RedisCoordStore},
    inference::HttpInferenceClient,
    media::FfmpegProcessor,
    storage::{catalog::MemoryCatalog, MemoryArtifactStore},
    worker::Worker,
};

#[derive(Parser, Debug)]
#[command(name = "pipeline-worker")]
#[command(about = "Video-analysis pipeline worker - consumes run requests from the stream")]
struct CliArgs {
    /// Coordination store endpoint
    #[arg(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Request stream key
    #[arg(long, default_value = "pipeline:requests")]
    stream: String,

    /// Consumer group name
    #[arg(long, default_value = "pipeline_workers")]
    group: String,

    /// Consumer name; derived from host and pid when omitted
    #[arg(long)]
    consumer: Option<String>,

    /// Parallel runs on this worker
    #[arg(long, default_value_t = 2)]
    max_concurrent: usize,

    /// Idle threshold before pending entries are reclaimed
    #[arg(long, default_value_t = 60_000)]
    reclaim_idle_ms: u64,

    /// Subject lock TTL in seconds
    #[arg(long, default_value_t = 1_800)]
    lock_ttl_seconds: u64,

    /// Registry key of the transcription service
    #[arg(long, default_value = "parakeet")]
    transcription_model: String,

    /// Skip stages completed in the subject's latest archived run
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Set the logging level
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,
}

impl CliArgs {
    fn into_config(self) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.redis_url = self.redis_url;
        config.stream = self.stream;
        config.group = self.group;
        if let Some(consumer) = self.consumer {
            config.consumer = consumer;
        }
        config.limits.runs = self.max_concurrent;
        config.reclaim_idle = Duration::from_millis(self.reclaim_idle_ms);
        config.lock_ttl = Duration::from_secs(self.lock_ttl_seconds);
        config.transcription_model = self.transcription_model;
        config.resume = self.resume;
        config
    }
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = args.into_config();
    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

async fn run(config: WorkerConfig) -> Result<(), ExitCode> {
    let store = match RedisCoordStore::new(&config.redis_url, 16) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "coordination store client init failed");
            return Err(ExitCode::from(1));
        }
    };
    if let Err(err) = store.ping().await {
        error!(
            redis_url = %config.redis_url,
            error = %err,
            "coordination store unreachable"
        );
        return Err(ExitCode::from(1));
    }

    let inference = match HttpInferenceClient::new(config.timeouts.clone()) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "inference client init failed");
            return Err(ExitCode::from(1));
        }
    };

    // Artifact and catalog backends are deployment integrations; the
    // reference worker runs with in-process implementations.
    let app = match PipelineContext::new(
        config,
        store,
        inference,
        Arc::new(FfmpegProcessor::new()),
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(MemoryCatalog::new()),
    ) {
        Ok(app) => app,
        Err(err) => {
            error!(error = %err, "context init failed");
            return Err(ExitCode::from(1));
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let worker = Worker::new(app, shutdown);
    match worker.run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "worker failed");
            Err(ExitCode::from(1))
        }
    }
}
