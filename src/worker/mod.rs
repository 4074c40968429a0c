//! Worker process: pulls run requests from the stream, executes them
//! through the orchestrator, and acknowledges terminal outcomes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        governor::Resource,
        lock::LockHandle,
        types::RunState,
    },
    orchestrator::Orchestrator,
    protocols::run::RunRequest,
    queue::{Delivery, StreamDispatcher},
};

pub struct Worker {
    app: Arc<PipelineContext>,
    dispatcher: Arc<StreamDispatcher>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(app: Arc<PipelineContext>, shutdown: CancellationToken) -> Self {
        let dispatcher = Arc::new(StreamDispatcher::new(
            Arc::clone(&app.store),
            app.config.stream.clone(),
            app.config.group.clone(),
            app.config.consumer.clone(),
        ));
        Self {
            app,
            dispatcher,
            shutdown,
        }
    }

    /// Main loop. Returns once the shutdown token fires and in-flight
    /// runs have drained (or the grace window elapsed).
    pub async fn run(&self) -> PipelineResult<()> {
        self.app.registry.seed_defaults().await?;
        self.dispatcher.ensure_group().await?;
        info!(
            consumer = self.dispatcher.consumer(),
            max_concurrent = self.app.config.limits.runs,
            "pipeline worker started"
        );

        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut reclaim = tokio::time::interval(self.app.config.reclaim_idle);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; use it to pick up entries
        // orphaned before this worker started.
        let mut next_is_reclaim = true;

        while !self.shutdown.is_cancelled() {
            while handlers.try_join_next().is_some() {}

            // Hold a run permit before taking an entry off the stream,
            // so claimed entries never sit idle behind a full worker.
            let permit = match self.app.governor.acquire(Resource::Runs, &self.shutdown).await {
                Ok(permit) => permit,
                Err(PipelineError::Cancelled) => break,
                Err(err) => return Err(err),
            };

            let deliveries = if next_is_reclaim {
                next_is_reclaim = false;
                reclaim.reset();
                match self
                    .dispatcher
                    .reclaim_idle(self.app.config.reclaim_idle, 1)
                    .await
                {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        warn!(error = %err, "reclaim failed");
                        Vec::new()
                    }
                }
            } else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = reclaim.tick() => {
                        next_is_reclaim = true;
                        Vec::new()
                    }
                    result = self.dispatcher.read(1, self.app.config.block) => match result {
                        Ok(deliveries) => deliveries,
                        Err(err) => {
                            warn!(error = %err, "stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Vec::new()
                        }
                    }
                }
            };

            match deliveries.into_iter().next() {
                Some(delivery) => {
                    let app = Arc::clone(&self.app);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    handlers.spawn(async move {
                        handle_delivery(app, dispatcher, delivery).await;
                        drop(permit);
                    });
                }
                None => drop(permit),
            }
        }

        if !handlers.is_empty() {
            info!(
                in_flight = handlers.len(),
                grace_secs = self.app.config.shutdown_grace.as_secs(),
                "shutting down; waiting for in-flight runs"
            );
            let drained = tokio::time::timeout(self.app.config.shutdown_grace, async {
                while handlers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("shutdown grace elapsed with runs still in flight");
            }
        }
        info!(consumer = self.dispatcher.consumer(), "pipeline worker stopped");
        Ok(())
    }
}

/// Process one stream entry end to end. Acks only on terminal outcome;
/// a handler that errors before the archive leaves the entry pending
/// for reclaim.
async fn handle_delivery(
    app: Arc<PipelineContext>,
    dispatcher: Arc<StreamDispatcher>,
    delivery: Delivery,
) {
    let stream_id = delivery.stream_id.clone();
    let request = match delivery.request {
        Ok(request) => request,
        Err(err) => {
            // Malformed payloads can never become runnable; drop them
            // from the pending list instead of reclaiming forever.
            error!(stream_id, error = %err, "malformed stream entry; acknowledging");
            let _ = dispatcher.ack(&stream_id).await;
            return;
        }
    };

    let subject_id = request.subject_id.clone();
    let run_id = request.run_id.clone();

    if let Err(err) = validate_models(&app, &request).await {
        // Unknown model mid-run is terminal: record the failure, then
        // archive and ack so the entry is not redelivered. The status
        // hash is only written while holding the subject lock.
        error!(subject_id, run_id, error = %err, "model validation failed");
        let Some(lock) = adopt_or_acquire(&app, &subject_id, &run_id).await else {
            warn!(subject_id, run_id, "subject locked by another run; deferring entry");
            return;
        };
        let _ = app
            .status
            .set_error(&subject_id, None, &err.to_string())
            .await;
        let _ = app.status.set_state(&subject_id, RunState::Failed).await;
        if app.history.archive(&subject_id).await.is_ok() {
            let _ = dispatcher.ack(&stream_id).await;
        }
        let _ = app.locks.release(&lock).await;
        return;
    }

    let Some(lock) = adopt_or_acquire(&app, &subject_id, &run_id).await else {
        // Another run holds the subject; leave the entry pending and
        // let a later reclaim retry it.
        warn!(subject_id, run_id, "subject locked by another run; deferring entry");
        return;
    };

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(&app);
    match orchestrator.execute(request, lock, cancel).await {
        Ok(outcome) => {
            info!(
                subject_id,
                run_id,
                state = %outcome.state,
                "run finished; acknowledging entry"
            );
            if let Err(err) = dispatcher.ack(&stream_id).await {
                error!(stream_id, error = %err, "ack failed after terminal outcome");
            }
        }
        Err(err) => {
            // Not terminal (e.g. archive failed): keep the entry
            // pending so another worker reclaims it.
            error!(subject_id, run_id, error = %err, "run did not reach a terminal state");
        }
    }
}

async fn validate_models(app: &PipelineContext, request: &RunRequest) -> PipelineResult<()> {
    app.registry.get(&request.config.generation_model).await?;
    app.registry.get(&request.config.refinement_model).await?;
    app.registry.get(&app.config.transcription_model).await?;
    Ok(())
}

/// Take ownership of the subject lock for this run: adopt the token the
/// enqueue adapter stored (the run id), or re-acquire it when the lock
/// expired (crashed-worker reclaim). `None` when another run holds it.
async fn adopt_or_acquire(
    app: &PipelineContext,
    subject_id: &str,
    run_id: &str,
) -> Option<LockHandle> {
    let adopted = LockHandle::adopt(subject_id, run_id);
    match app.locks.refresh(&adopted).await {
        Ok(()) => return Some(adopted),
        Err(PipelineError::LockLost { .. }) => {}
        Err(err) => {
            warn!(subject_id, error = %err, "lock refresh failed");
            return None;
        }
    }
    match app.locks.acquire(subject_id, run_id).await {
        Ok(handle) => Some(handle),
        Err(PipelineError::Conflict { .. }) => None,
        Err(err) => {
            warn!(subject_id, error = %err, "lock acquire failed");
            None
        }
    }
}
