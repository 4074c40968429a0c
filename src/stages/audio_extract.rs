//! Audio extraction: codec subprocess producing a wav in the run's
//! scratch directory.

use async_trait::async_trait;
use tracing::info;

use super::{ensure_local_media, require_video, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{error::PipelineResult, types::StageId},
};

pub struct AudioExtractStage;

#[async_trait]
impl Stage for AudioExtractStage {
    fn id(&self) -> StageId {
        StageId::AudioExtract
    }

    async fn should_skip(
        &self,
        _app: &PipelineContext,
        _ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        require_video(app, ctx).await?;
        let input = ensure_local_media(app, ctx).await?;
        let output = ctx.temp.path().join(format!("{}.wav", ctx.subject_id()));

        app.media.extract_audio(&input, &output).await?;
        info!(subject_id = %ctx.subject_id(), path = %output.display(), "extracted audio");

        ctx.audio_path = Some(output);
        Ok(())
    }
}
