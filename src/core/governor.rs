//! Process-global counting semaphores bounding parallel work across all
//! runs on this worker.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    config::types::ConcurrencyLimits,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
};

/// Resources with bounded parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Runs,
    AudioExtraction,
    Transcription,
    MomentGeneration,
    ClipExtraction,
    Refinement,
}

impl Resource {
    /// The stage-level semaphore the orchestrator acquires before
    /// running a stage. Download and the upload stages are I/O-bound
    /// and unbounded; ClipExtract and Refinement fan out per item and
    /// take [`Resource::ClipExtraction`] / [`Resource::Refinement`]
    /// permits inside the stage instead.
    pub fn for_stage(stage: StageId) -> Option<Resource> {
        match stage {
            StageId::AudioExtract => Some(Resource::AudioExtraction),
            StageId::Transcribe => Some(Resource::Transcription),
            StageId::MomentGeneration => Some(Resource::MomentGeneration),
            StageId::Download
            | StageId::AudioUpload
            | StageId::ClipExtract
            | StageId::ClipUpload
            | StageId::Refinement => None,
        }
    }
}

pub struct ConcurrencyGovernor {
    runs: Arc<Semaphore>,
    audio_extraction: Arc<Semaphore>,
    transcription: Arc<Semaphore>,
    moment_generation: Arc<Semaphore>,
    clip_extraction: Arc<Semaphore>,
    refinement: Arc<Semaphore>,
}

impl ConcurrencyGovernor {
    pub fn new(limits: &ConcurrencyLimits) -> Self {
        Self {
            runs: Arc::new(Semaphore::new(limits.runs)),
            audio_extraction: Arc::new(Semaphore::new(limits.audio_extraction)),
            transcription: Arc::new(Semaphore::new(limits.transcription)),
            moment_generation: Arc::new(Semaphore::new(limits.moment_generation)),
            clip_extraction: Arc::new(Semaphore::new(limits.clip_extraction)),
            refinement: Arc::new(Semaphore::new(limits.refinement)),
        }
    }

    fn semaphore(&self, resource: Resource) -> Arc<Semaphore> {
        match resource {
            Resource::Runs => Arc::clone(&self.runs),
            Resource::AudioExtraction => Arc::clone(&self.audio_extraction),
            Resource::Transcription => Arc::clone(&self.transcription),
            Resource::MomentGeneration => Arc::clone(&self.moment_generation),
            Resource::ClipExtraction => Arc::clone(&self.clip_extraction),
            Resource::Refinement => Arc::clone(&self.refinement),
        }
    }

    /// Waiter-fair, cancellation-aware acquire. A caller cancelled
    /// while queued unblocks with `Cancelled` and reserves nothing.
    pub async fn acquire(
        &self,
        resource: Resource,
        cancel: &CancellationToken,
    ) -> PipelineResult<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(resource);
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| PipelineError::Cancelled)
            }
        }
    }

    pub fn available(&self, resource: Resource) -> usize {
        self.semaphore(resource).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> ConcurrencyGovernor {
        ConcurrencyGovernor::new(&ConcurrencyLimits::default())
    }

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let governor = governor();
        let cancel = CancellationToken::new();
        assert_eq!(governor.available(Resource::Refinement), 1);
        let permit = governor
            .acquire(Resource::Refinement, &cancel)
            .await
            .unwrap();
        assert_eq!(governor.available(Resource::Refinement), 0);
        drop(permit);
        assert_eq!(governor.available(Resource::Refinement), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_unblocks_without_permit() {
        let governor = governor();
        let cancel = CancellationToken::new();
        let _held = governor
            .acquire(Resource::Refinement, &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let result = governor.acquire(Resource::Refinement, &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        // The failed acquire reserved nothing.
        assert_eq!(governor.available(Resource::Refinement), 0);
    }

    #[test]
    fn stage_resource_mapping() {
        assert_eq!(
            Resource::for_stage(StageId::Transcribe),
            Some(Resource::Transcription)
        );
        assert_eq!(Resource::for_stage(StageId::Download), None);
        // Fan-out stages take per-item permits themselves.
        assert_eq!(Resource::for_stage(StageId::ClipExtract), None);
        assert_eq!(Resource::for_stage(StageId::Refinement), None);
    }
}
