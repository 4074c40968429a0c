//! Run orchestration: executes the ordered stages for one run,
//! threading the typed context, honoring cooperative cancellation, and
//! archiving the run at a single terminal point.

use std::{collections::HashSet, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        governor::Resource,
        lock::LockHandle,
        status::StatusManager,
        types::{RunState, StageId, StageStatus},
    },
    protocols::run::RunRequest,
    stages::{ordered_stages, RunContext},
    storage::catalog::RunHistoryRecord,
};

/// How often an in-flight run polls the cancel key.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Terminal summary of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub subject_id: String,
    pub state: RunState,
    pub error_stage: Option<StageId>,
    pub error_message: Option<String>,
    pub total_moments: usize,
    pub total_clips: usize,
}

/// What the stage loop concluded before terminal bookkeeping.
struct LoopVerdict {
    cancelled: bool,
    failed: Option<(StageId, String)>,
    recoverable_seen: bool,
}

/// Bridge the cancel key to the run's token so checkpoints inside long
/// stages (clip loop, refinement loop, HTTP waits) observe a cancel
/// request without waiting for a stage boundary.
fn spawn_cancel_watcher(
    status: StatusManager,
    subject_id: String,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                    if status.is_cancel_requested(&subject_id).await.unwrap_or(false) {
                        token.cancel();
                        break;
                    }
                }
            }
        }
    })
}

pub struct Orchestrator<'a> {
    app: &'a PipelineContext,
}

impl<'a> Orchestrator<'a> {
    pub fn new(app: &'a PipelineContext) -> Self {
        Self { app }
    }

    /// Run every stage for `request`. The caller owns the stream entry
    /// and acks it only when this returns `Ok` — the run is then in a
    /// terminal state AND archived. The lock is released on all paths.
    pub async fn execute(
        &self,
        request: RunRequest,
        lock: LockHandle,
        cancel: CancellationToken,
    ) -> PipelineResult<RunOutcome> {
        let subject_id = request.subject_id.clone();
        let result = self.execute_locked(request, &lock, cancel).await;

        // Release regardless of how execution ended; a handler that
        // cannot release logs loudly and TTL expiry recovers.
        if let Err(err) = self.app.locks.release(&lock).await {
            error!(subject_id, error = %err, "failed to release pipeline lock");
        }
        result
    }

    async fn execute_locked(
        &self,
        request: RunRequest,
        lock: &LockHandle,
        cancel: CancellationToken,
    ) -> PipelineResult<RunOutcome> {
        let app = self.app;
        let subject_id = request.subject_id.clone();
        let run_id = request.run_id.clone();

        // Assert ownership up front; a run whose lock is gone must not
        // write the status hash any longer than necessary.
        if let Err(err) = app.locks.refresh(lock).await {
            if !matches!(err, PipelineError::LockLost { .. }) {
                return Err(err);
            }
            warn!(subject_id, "lock lost before execution; failing run");
            let message = err.to_string();
            app.status.set_error(&subject_id, None, &message).await?;
            app.status.set_state(&subject_id, RunState::Failed).await?;
            app.history.archive(&subject_id).await?;
            return Ok(RunOutcome {
                run_id,
                subject_id,
                state: RunState::Failed,
                error_stage: None,
                error_message: Some(message),
                total_moments: 0,
                total_clips: 0,
            });
        }
        app.status.set_state(&subject_id, RunState::Running).await?;

        let resume_completed = if app.config.resume {
            self.completed_in_latest_run(&subject_id).await
        } else {
            HashSet::new()
        };

        let mut ctx = RunContext::new(request, cancel, &app.config.temp_root)?;
        let cancel_watcher = spawn_cancel_watcher(
            app.status.clone(),
            subject_id.clone(),
            ctx.cancel.clone(),
        );

        // Durable history row; failure here is non-fatal for the run.
        let history_id = self.create_history_row(&mut ctx).await;

        let verdict = self.run_stages(&mut ctx, lock, &resume_completed).await;
        cancel_watcher.abort();
        let mut verdict = verdict?;

        // A watcher-initiated cancel that landed between the last
        // boundary check and stage completion still counts.
        if !verdict.cancelled && verdict.failed.is_none() && ctx.cancel.is_cancelled() {
            verdict.cancelled = true;
        }

        let state = if verdict.cancelled {
            RunState::Cancelled
        } else if verdict.failed.is_some() {
            RunState::Failed
        } else if verdict.recoverable_seen || ctx.recoverable_failures > 0 {
            RunState::Partial
        } else {
            RunState::Completed
        };
        app.status.set_state(&subject_id, state).await?;
        if verdict.cancelled {
            app.status.clear_cancel(&subject_id).await?;
        }

        let outcome = RunOutcome {
            run_id: run_id.clone(),
            subject_id: subject_id.clone(),
            state,
            error_stage: verdict.failed.as_ref().map(|(stage, _)| *stage),
            error_message: verdict.failed.as_ref().map(|(_, message)| message.clone()),
            total_moments: ctx.moments.len(),
            total_clips: ctx.moments.iter().filter(|m| m.clip_url.is_some()).count(),
        };

        self.finish_history_row(history_id, &ctx, &outcome).await;

        // Single terminal archive point. If this fails the caller gets
        // an error and leaves the stream entry unacked for reclaim.
        self.app.history.archive(&subject_id).await?;

        info!(
            subject_id,
            run_id,
            state = %state,
            moments = outcome.total_moments,
            clips = outcome.total_clips,
            "run reached terminal state"
        );
        Ok(outcome)
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        lock: &LockHandle,
        resume_completed: &HashSet<StageId>,
    ) -> PipelineResult<LoopVerdict> {
        let app = self.app;
        let subject_id = ctx.subject_id().to_string();
        let mut verdict = LoopVerdict {
            cancelled: false,
            failed: None,
            recoverable_seen: false,
        };

        for stage in ordered_stages() {
            let stage_id = stage.id();

            // (a) cancellation boundary
            if ctx.cancel.is_cancelled()
                || app.status.is_cancel_requested(&subject_id).await?
            {
                ctx.cancel.cancel();
                verdict.cancelled = true;
                break;
            }

            if resume_completed.contains(&stage_id) {
                app.status
                    .mark_stage_skipped(&subject_id, stage_id, "completed in previous run")
                    .await?;
                continue;
            }

            // (b) skip rule, before any resource acquisition
            match stage.should_skip(app, ctx).await {
                Ok(Some(reason)) => {
                    app.status
                        .mark_stage_skipped(&subject_id, stage_id, &reason)
                        .await?;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    app.status
                        .mark_stage_failed(&subject_id, stage_id, &err.to_string())
                        .await?;
                    verdict.failed = Some((stage_id, err.to_string()));
                    break;
                }
            }

            // (c) stage-level permit
            let _permit = match Resource::for_stage(stage_id) {
                Some(resource) => match app.governor.acquire(resource, &ctx.cancel).await {
                    Ok(permit) => Some(permit),
                    Err(PipelineError::Cancelled) => {
                        verdict.cancelled = true;
                        break;
                    }
                    Err(err) => {
                        app.status
                            .mark_stage_failed(&subject_id, stage_id, &err.to_string())
                            .await?;
                        verdict.failed = Some((stage_id, err.to_string()));
                        break;
                    }
                },
                None => None,
            };

            // (d) start bookkeeping; the lock must outlive the stage
            app.status.set_current_stage(&subject_id, stage_id).await?;
            app.status.mark_stage_started(&subject_id, stage_id).await?;
            if let Err(err) = app.locks.refresh(lock).await {
                let message = err.to_string();
                app.status
                    .mark_stage_failed(&subject_id, stage_id, &message)
                    .await?;
                verdict.failed = Some((stage_id, message));
                break;
            }

            // (e) run
            match stage.run(app, ctx).await {
                Ok(()) => {
                    app.status
                        .mark_stage_completed(&subject_id, stage_id)
                        .await?;
                }
                Err(PipelineError::Cancelled) => {
                    verdict.cancelled = true;
                    break;
                }
                Err(err) if err.is_recoverable() => {
                    warn!(
                        subject_id,
                        stage = %stage_id,
                        error = %err,
                        "recoverable stage error; continuing"
                    );
                    app.status
                        .mark_stage_failed(&subject_id, stage_id, &err.to_string())
                        .await?;
                    verdict.recoverable_seen = true;
                }
                Err(err) => {
                    app.status
                        .mark_stage_failed(&subject_id, stage_id, &err.to_string())
                        .await?;
                    verdict.failed = Some((stage_id, err.to_string()));
                    break;
                }
            }
        }

        Ok(verdict)
    }

    /// Stage ids marked completed in the subject's latest archived run.
    async fn completed_in_latest_run(&self, subject_id: &str) -> HashSet<StageId> {
        match self.app.history.latest(subject_id).await {
            Ok(Some(snapshot)) => snapshot
                .stages
                .iter()
                .filter(|(_, status)| **status == StageStatus::Completed)
                .map(|(stage, _)| *stage)
                .collect(),
            Ok(None) => HashSet::new(),
            Err(err) => {
                warn!(subject_id, error = %err, "could not load resume history");
                HashSet::new()
            }
        }
    }

    async fn create_history_row(&self, ctx: &mut RunContext) -> Option<i64> {
        let video = match crate::stages::require_video(self.app, ctx).await {
            Ok(video) => video,
            Err(err) => {
                warn!(
                    subject_id = %ctx.subject_id(),
                    error = %err,
                    "no catalog row for subject; durable history skipped"
                );
                return None;
            }
        };
        match self
            .app
            .catalog
            .create_run_history(&ctx.request.run_id, video.id, Utc::now())
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(
                    subject_id = %ctx.subject_id(),
                    error = %err,
                    "failed to create durable history row"
                );
                None
            }
        }
    }

    async fn finish_history_row(
        &self,
        history_id: Option<i64>,
        ctx: &RunContext,
        outcome: &RunOutcome,
    ) {
        let Some(id) = history_id else { return };
        let Some(video) = &ctx.video else { return };
        let record = RunHistoryRecord {
            id,
            run_id: outcome.run_id.clone(),
            video_id: video.id,
            state: outcome.state.as_str().to_string(),
            started_at: ctx.request.requested_at,
            completed_at: Some(Utc::now()),
            total_moments: Some(outcome.total_moments as u64),
            total_clips: Some(outcome.total_clips as u64),
            error_stage: outcome.error_stage.map(|s| s.as_str().to_string()),
            error_message: outcome.error_message.clone(),
        };
        if let Err(err) = self.app.catalog.finish_run_history(&record).await {
            warn!(
                subject_id = %outcome.subject_id,
                error = %err,
                "failed to finalize durable history row"
            );
        }
    }
}
