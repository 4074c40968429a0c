//! Transcription: call the remote ASR service through a tunnel and
//! persist the transcript record.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{require_video, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
    storage::catalog::NewTranscript,
};

pub struct TranscribeStage;

#[async_trait]
impl Stage for TranscribeStage {
    fn id(&self) -> StageId {
        StageId::Transcribe
    }

    async fn should_skip(
        &self,
        _app: &PipelineContext,
        _ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        let video = require_video(app, ctx).await?;
        let audio_path = ctx
            .audio_path
            .clone()
            .ok_or_else(|| PipelineError::Storage("no extracted audio to transcribe".into()))?;

        let handle = app
            .tunnels
            .acquire(&app.config.transcription_model, &ctx.cancel)
            .await?;
        let result = app
            .inference
            .transcribe(&handle, &audio_path, &ctx.cancel)
            .await;
        handle.release().await;
        let result = result?;

        if result.is_empty() {
            // An empty transcript is a completed transcription, not a
            // failure; generation may still run on it.
            warn!(subject_id = %ctx.subject_id(), "transcription returned no segments");
        }

        let record = app
            .catalog
            .create_transcript(NewTranscript {
                video_id: video.id,
                text: result.transcription.clone(),
                word_timestamps: result.word_timestamps.clone(),
                segment_timestamps: result.segment_timestamps.clone(),
            })
            .await?;

        info!(
            subject_id = %ctx.subject_id(),
            transcript_id = record.id,
            segments = record.segment_timestamps.len(),
            processing_time = result.processing_time,
            "transcript persisted"
        );
        ctx.transcript = Some(record);
        Ok(())
    }
}
