//! Download stage: fetch the source media, probe it, upload the full
//! copy to the object store, and persist subject metadata.

use async_trait::async_trait;
use tracing::info;

use super::{fetch_to_file, require_video, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
};

pub struct DownloadStage;

#[async_trait]
impl Stage for DownloadStage {
    fn id(&self) -> StageId {
        StageId::Download
    }

    async fn should_skip(
        &self,
        app: &PipelineContext,
        ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        let video = require_video(app, ctx).await?;
        if video.cloud_url.is_some() && !ctx.request.config.force_download {
            return Ok(Some("cloud copy already registered".to_string()));
        }
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        let mut video = require_video(app, ctx).await?;
        let source_url = video.source_url.clone().ok_or_else(|| {
            PipelineError::Storage(format!("subject {} has no source URL", video.identifier))
        })?;

        let local_path = ctx.temp.path().join(format!("{}.mp4", ctx.subject_id()));
        let bytes = fetch_to_file(&app.http, &source_url, &local_path, &ctx.cancel).await?;
        info!(subject_id = %ctx.subject_id(), bytes, "downloaded source media");

        let info = app.media.probe(&local_path).await?;

        // Write-once store: the run id makes the key unique across
        // re-downloads of the same subject.
        let key = format!("media/{}/{}.mp4", ctx.subject_id(), ctx.request.run_id);
        app.artifacts.put_file(&key, &local_path).await?;

        video.cloud_url = Some(key);
        video.duration_seconds = Some(info.duration_seconds);
        video.width = info.width;
        video.height = info.height;
        video.fps = info.fps;
        video.video_codec = info.video_codec.clone();
        video.audio_codec = info.audio_codec.clone();
        video.size_bytes = info.size_bytes.or(Some(bytes));
        app.catalog.update_video(&video).await?;

        ctx.media_info = Some(info);
        ctx.local_video_path = Some(local_path);
        ctx.video = Some(video);
        Ok(())
    }
}
