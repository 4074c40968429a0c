//! Clip upload: put each extracted clip in the object store and
//! persist the clip record with the padding actually applied.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{refinement_supports_video, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
    storage::catalog::NewClip,
};

pub struct ClipUploadStage;

#[async_trait]
impl Stage for ClipUploadStage {
    fn id(&self) -> StageId {
        StageId::ClipUpload
    }

    async fn should_skip(
        &self,
        app: &PipelineContext,
        ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        if !refinement_supports_video(app, ctx).await? {
            return Ok(Some("refinement model does not accept video".to_string()));
        }
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        let subject_id = ctx.subject_id().to_string();
        let run_id = ctx.request.run_id.clone();
        let default_padding = (
            ctx.request.config.padding_left_seconds,
            ctx.request.config.padding_right_seconds,
        );
        let mut uploaded = 0usize;

        for index in 0..ctx.moments.len() {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let (identifier, moment_id, clip_path, applied) = {
                let work = &ctx.moments[index];
                if work.clip_failed {
                    continue;
                }
                let Some(path) = work.clip_path.clone() else {
                    continue;
                };
                (
                    work.record.identifier.clone(),
                    work.record.id,
                    path,
                    work.applied_padding.unwrap_or(default_padding),
                )
            };

            let key = format!("clips/{subject_id}/{run_id}/{identifier}.mp4");
            let result = async {
                app.artifacts.put_file(&key, &clip_path).await?;
                let url = app
                    .artifacts
                    .signed_url(&key, app.config.signed_url_ttl)
                    .await?;
                app.catalog
                    .create_clip(NewClip {
                        moment_id,
                        cloud_url: url.clone(),
                        padding_left: applied.0,
                        padding_right: applied.1,
                    })
                    .await?;
                Ok::<String, PipelineError>(url)
            }
            .await;

            match result {
                Ok(url) => {
                    ctx.moments[index].clip_url = Some(url);
                    uploaded += 1;
                }
                Err(err) => {
                    ctx.moments[index].clip_failed = true;
                    ctx.recoverable_failures += 1;
                    warn!(
                        subject_id,
                        moment = %identifier,
                        error = %err,
                        "clip upload failed for one moment"
                    );
                }
            }
        }

        info!(subject_id, uploaded, "clip upload finished");
        Ok(())
    }
}
