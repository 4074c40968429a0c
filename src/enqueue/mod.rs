//! Enqueue adapter: the thin interface the web layer calls to submit,
//! observe, and cancel runs. All state lives in the coordination store;
//! this type is stateless.

use std::sync::Arc;

use tracing::info;

use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        status::StatusSnapshot,
    },
    protocols::run::{RunConfig, RunRequest},
};

/// Successful submission.
#[derive(Debug, Clone)]
pub struct RunAccepted {
    pub run_id: String,
    pub subject_id: String,
}

pub struct EnqueueService {
    app: Arc<PipelineContext>,
}

impl EnqueueService {
    pub fn new(app: Arc<PipelineContext>) -> Self {
        Self { app }
    }

    /// Validate, lock, initialize status, append to the stream.
    ///
    /// Exactly one of N concurrent submissions for the same subject
    /// wins the lock; the rest get `Conflict`. The lock token is the
    /// run id, which the executing worker later adopts.
    pub async fn submit(
        &self,
        subject_id: &str,
        config: RunConfig,
    ) -> PipelineResult<RunAccepted> {
        config.validate()?;
        for model_key in [&config.generation_model, &config.refinement_model] {
            if let Err(err) = self.app.registry.get(model_key).await {
                return match err {
                    PipelineError::ModelNotRegistered { model_key, available } => {
                        Err(PipelineError::Validation(format!(
                            "model '{model_key}' is not registered (available: {available:?})"
                        )))
                    }
                    other => Err(other),
                };
            }
        }
        if self
            .app
            .catalog
            .video_by_identifier(subject_id)
            .await?
            .is_none()
        {
            return Err(PipelineError::Validation(format!(
                "unknown subject: {subject_id}"
            )));
        }

        let request = RunRequest::new(subject_id, config);
        let lock = self
            .app
            .locks
            .acquire(subject_id, &request.run_id)
            .await?;

        // From here on the submission must land on the stream; if any
        // step fails, surrender the lock so the subject is not wedged.
        let enqueue = async {
            self.app.status.initialize(&request).await?;
            self.app
                .store
                .stream_add(&self.app.config.stream, &request.to_fields()?)
                .await?;
            Ok::<(), PipelineError>(())
        }
        .await;

        if let Err(err) = enqueue {
            let _ = self.app.locks.release(&lock).await;
            return Err(err);
        }

        info!(subject_id, run_id = %request.run_id, "run accepted");
        Ok(RunAccepted {
            run_id: request.run_id,
            subject_id: subject_id.to_string(),
        })
    }

    /// Live status, falling back to the latest archived run.
    pub async fn status(&self, subject_id: &str) -> PipelineResult<Option<StatusSnapshot>> {
        if let Some(snapshot) = self.app.status.snapshot(subject_id).await? {
            return Ok(Some(snapshot));
        }
        self.app.history.latest(subject_id).await
    }

    /// Request graceful cancellation. Idempotent; the flag has a TTL so
    /// a cancel with no active run is harmless.
    pub async fn cancel(&self, subject_id: &str) -> PipelineResult<()> {
        self.app.status.request_cancel(subject_id).await
    }

    /// Newest-first archived runs.
    pub async fn history(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<StatusSnapshot>> {
        self.app.history.list(subject_id, limit).await
    }

    /// One archived run by id.
    pub async fn run(&self, run_id: &str) -> PipelineResult<Option<StatusSnapshot>> {
        self.app.history.run(run_id).await
    }
}
