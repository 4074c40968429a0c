//! Audio upload: put the extracted wav in the object store and produce
//! a signed URL for the transcription call.

use async_trait::async_trait;
use tracing::info;

use super::{RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
};

pub struct AudioUploadStage;

#[async_trait]
impl Stage for AudioUploadStage {
    fn id(&self) -> StageId {
        StageId::AudioUpload
    }

    async fn should_skip(
        &self,
        _app: &PipelineContext,
        _ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        let audio_path = ctx
            .audio_path
            .clone()
            .ok_or_else(|| PipelineError::Storage("no extracted audio to upload".into()))?;

        let key = format!("audio/{}/{}.wav", ctx.subject_id(), ctx.request.run_id);
        app.artifacts.put_file(&key, &audio_path).await?;
        let url = app
            .artifacts
            .signed_url(&key, app.config.signed_url_ttl)
            .await?;

        info!(subject_id = %ctx.subject_id(), key, "uploaded audio artifact");
        ctx.audio_url = Some(url);
        Ok(())
    }
}
