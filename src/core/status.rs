//! Live run status: the `pipeline:{subject}:active` hash and the
//! cancellation flag.
//!
//! The lock-holding worker is the sole writer of the active hash.
//! Readers (the enqueue adapter, monitoring) get eventually consistent
//! snapshots.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::{
    core::{
        error::PipelineResult,
        keys,
        types::{RunState, StageId, StageStatus},
    },
    data_connector::CoordStore,
    protocols::run::RunRequest,
};

/// Typed view over an active or archived run hash.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub run_id: String,
    pub subject_id: String,
    pub state: RunState,
    pub current_stage: Option<StageId>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub stages: HashMap<StageId, StageStatus>,
    /// Full raw field map, progress counters included.
    pub fields: HashMap<String, String>,
}

impl StatusSnapshot {
    pub fn from_fields(fields: HashMap<String, String>) -> Option<Self> {
        let run_id = fields.get("run_id")?.clone();
        let subject_id = fields.get("subject_id").cloned().unwrap_or_default();
        let state = fields
            .get("state")
            .and_then(|s| RunState::parse(s))
            .unwrap_or(RunState::Queued);
        let current_stage = fields
            .get("current_stage")
            .and_then(|s| StageId::parse(s));
        let non_empty = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

        let mut stages = HashMap::new();
        for stage in StageId::ORDERED {
            if let Some(status) = fields
                .get(&format!("{stage}_state"))
                .and_then(|s| StageStatus::parse(s))
            {
                stages.insert(stage, status);
            }
        }

        Some(Self {
            run_id,
            subject_id,
            state,
            current_stage,
            error_stage: non_empty("error_stage"),
            error_message: non_empty("error_message"),
            stages,
            fields,
        })
    }
}

#[derive(Clone)]
pub struct StatusManager {
    store: Arc<dyn CoordStore>,
    cancel_ttl: Duration,
}

impl StatusManager {
    pub fn new(store: Arc<dyn CoordStore>, cancel_ttl: Duration) -> Self {
        Self { store, cancel_ttl }
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    /// Write the initial hash for a freshly accepted run: state
    /// `queued`, every stage `pending`, zeroed progress counters.
    pub async fn initialize(&self, request: &RunRequest) -> PipelineResult<()> {
        let config = serde_json::to_string(&request.config).unwrap_or_default();
        let mut fields = vec![
            ("run_id".to_string(), request.run_id.clone()),
            ("subject_id".to_string(), request.subject_id.clone()),
            ("state".to_string(), RunState::Queued.as_str().to_string()),
            ("config".to_string(), config),
            (
                "generation_model".to_string(),
                request.config.generation_model.clone(),
            ),
            (
                "refinement_model".to_string(),
                request.config.refinement_model.clone(),
            ),
            ("queued_at".to_string(), request.requested_at.to_rfc3339()),
            ("started_at".to_string(), String::new()),
            ("completed_at".to_string(), String::new()),
            ("current_stage".to_string(), String::new()),
            ("error_stage".to_string(), String::new()),
            ("error_message".to_string(), String::new()),
        ];
        for stage in StageId::ORDERED {
            fields.push((format!("{stage}_state"), StageStatus::Pending.as_str().into()));
            fields.push((format!("{stage}_started_at"), String::new()));
            fields.push((format!("{stage}_completed_at"), String::new()));
            fields.push((format!("{stage}_error"), String::new()));
            fields.push((format!("{stage}_skip_reason"), String::new()));
        }
        for counter in [
            "clips_total",
            "clips_processed",
            "clips_failed",
            "refinement_total",
            "refinement_processed",
            "refinement_successful",
        ] {
            fields.push((counter.to_string(), "0".to_string()));
        }
        self.store
            .hash_set(&keys::active(&request.subject_id), &fields)
            .await?;
        info!(subject_id = %request.subject_id, run_id = %request.run_id, "initialized run status");
        Ok(())
    }

    pub async fn set_state(&self, subject_id: &str, state: RunState) -> PipelineResult<()> {
        let mut fields = vec![("state".to_string(), state.as_str().to_string())];
        if state == RunState::Running {
            fields.push(("started_at".to_string(), Self::now()));
        }
        if state.is_terminal() {
            fields.push(("completed_at".to_string(), Self::now()));
        }
        self.store.hash_set(&keys::active(subject_id), &fields).await?;
        info!(subject_id, state = %state, "run state transition");
        Ok(())
    }

    pub async fn set_current_stage(&self, subject_id: &str, stage: StageId) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[("current_stage".to_string(), stage.as_str().to_string())],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_stage_started(&self, subject_id: &str, stage: StageId) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    (format!("{stage}_state"), StageStatus::Running.as_str().into()),
                    (format!("{stage}_started_at"), Self::now()),
                ],
            )
            .await?;
        info!(subject_id, stage = %stage, "stage started");
        Ok(())
    }

    pub async fn mark_stage_completed(
        &self,
        subject_id: &str,
        stage: StageId,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    (
                        format!("{stage}_state"),
                        StageStatus::Completed.as_str().into(),
                    ),
                    (format!("{stage}_completed_at"), Self::now()),
                ],
            )
            .await?;
        info!(subject_id, stage = %stage, "stage completed");
        Ok(())
    }

    pub async fn mark_stage_skipped(
        &self,
        subject_id: &str,
        stage: StageId,
        reason: &str,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    (
                        format!("{stage}_state"),
                        StageStatus::Skipped.as_str().into(),
                    ),
                    (format!("{stage}_skip_reason"), reason.to_string()),
                ],
            )
            .await?;
        info!(subject_id, stage = %stage, reason, "stage skipped");
        Ok(())
    }

    pub async fn mark_stage_failed(
        &self,
        subject_id: &str,
        stage: StageId,
        message: &str,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    (format!("{stage}_state"), StageStatus::Failed.as_str().into()),
                    (format!("{stage}_completed_at"), Self::now()),
                    (format!("{stage}_error"), message.to_string()),
                    ("error_stage".to_string(), stage.as_str().to_string()),
                    ("error_message".to_string(), message.to_string()),
                ],
            )
            .await?;
        error!(subject_id, stage = %stage, message, "stage failed");
        Ok(())
    }

    /// Record a run-level error that is not attributable to a stage's
    /// own execution (e.g. a lost lock before any stage started).
    pub async fn set_error(
        &self,
        subject_id: &str,
        stage: Option<StageId>,
        message: &str,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    (
                        "error_stage".to_string(),
                        stage.map(|s| s.as_str().to_string()).unwrap_or_default(),
                    ),
                    ("error_message".to_string(), message.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn set_clip_progress(
        &self,
        subject_id: &str,
        total: usize,
        processed: usize,
        failed: usize,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    ("clips_total".to_string(), total.to_string()),
                    ("clips_processed".to_string(), processed.to_string()),
                    ("clips_failed".to_string(), failed.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn set_refinement_progress(
        &self,
        subject_id: &str,
        total: usize,
        processed: usize,
        successful: usize,
    ) -> PipelineResult<()> {
        self.store
            .hash_set(
                &keys::active(subject_id),
                &[
                    ("refinement_total".to_string(), total.to_string()),
                    ("refinement_processed".to_string(), processed.to_string()),
                    (
                        "refinement_successful".to_string(),
                        successful.to_string(),
                    ),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn snapshot(&self, subject_id: &str) -> PipelineResult<Option<StatusSnapshot>> {
        let fields = self.store.hash_get_all(&keys::active(subject_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(StatusSnapshot::from_fields(fields))
    }

    /// Set the cancel flag. Idempotent; the flag expires on its own.
    pub async fn request_cancel(&self, subject_id: &str) -> PipelineResult<()> {
        // Plain SET semantics: re-requesting refreshes the TTL.
        self.store.del(&keys::cancel(subject_id)).await?;
        self.store
            .set_nx_ex(&keys::cancel(subject_id), "1", self.cancel_ttl)
            .await?;
        info!(subject_id, "cancellation requested");
        Ok(())
    }

    pub async fn is_cancel_requested(&self, subject_id: &str) -> PipelineResult<bool> {
        Ok(self.store.exists(&keys::cancel(subject_id)).await?)
    }

    /// Drop the flag once the run has honored it.
    pub async fn clear_cancel(&self, subject_id: &str) -> PipelineResult<()> {
        self.store.del(&keys::cancel(subject_id)).await?;
        Ok(())
    }
}
