//! Clip extraction: one codec subprocess per moment, fanned out up to
//! the clip-extraction semaphore's capacity. A single failing clip is
//! recoverable; the moment is marked and later stages tolerate the
//! missing clip.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{info, warn};

use super::{ensure_local_media, refinement_supports_video, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        governor::Resource,
        types::StageId,
    },
    media::clamp_clip_bounds,
};

pub struct ClipExtractStage;

#[async_trait]
impl Stage for ClipExtractStage {
    fn id(&self) -> StageId {
        StageId::ClipExtract
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
        if ctx.moments.is_empty() {
            info!(subject_id = %ctx.subject_id(), "no moments; nothing to extract");
            return Ok(());
        }

        let input = ensure_local_media(app, ctx).await?;
        let duration = ctx.duration()?;
        let config = ctx.request.config.clone();
        let cancel = ctx.cancel.clone();
        let subject_id = ctx.subject_id().to_string();
        let temp_dir = ctx.temp.path().to_path_buf();
        let total = ctx.moments.len();

        app.status.set_clip_progress(&subject_id, total, 0, 0).await?;

        let processed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let processed = &processed;
        let failed = &failed;
        let config_ref = &config;
        let subject_ref = &subject_id;

        let jobs: Vec<_> = ctx.moments.iter().enumerate().map(|(index, work)| {
            let record = work.record.clone();
            let input = input.clone();
            let output = temp_dir.join(format!("clip-{}.mp4", record.identifier));
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (index, Err(PipelineError::Cancelled), (0.0, 0.0));
                }
                let permit = match app.governor.acquire(Resource::ClipExtraction, &cancel).await {
                    Ok(permit) => permit,
                    Err(err) => return (index, Err(err), (0.0, 0.0)),
                };

                let (clip_start, clip_end) = clamp_clip_bounds(
                    record.start_time,
                    record.end_time,
                    config_ref.padding_left_seconds,
                    config_ref.padding_right_seconds,
                    duration,
                );
                let applied = (
                    record.start_time - clip_start,
                    clip_end - record.end_time,
                );
                let result = app.media.cut_clip(&input, &output, clip_start, clip_end).await;
                drop(permit);

                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                let bad = if result.is_err() {
                    failed.fetch_add(1, Ordering::SeqCst) + 1
                } else {
                    failed.load(Ordering::SeqCst)
                };
                let _ = app.status.set_clip_progress(subject_ref, total, done, bad).await;

                (index, result.map(|_| output), applied)
            }
        }).collect();

        let results: Vec<_> = futures_util::stream::iter(jobs)
            .buffer_unordered(app.config.limits.clip_extraction)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut succeeded = 0usize;
        for (index, result, applied) in results {
            match result {
                Ok(path) => {
                    let work = &mut ctx.moments[index];
                    work.clip_path = Some(path);
                    work.applied_padding = Some(applied);
                    succeeded += 1;
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    let identifier = ctx.moments[index].record.identifier.clone();
                    ctx.moments[index].clip_failed = true;
                    ctx.recoverable_failures += 1;
                    warn!(
                        subject_id = %subject_id,
                        moment = %identifier,
                        error = %err,
                        "clip extraction failed for one moment"
                    );
                }
            }
        }

        info!(
            subject_id = %subject_id,
            succeeded,
            failed = total - succeeded,
            "clip extraction finished"
        );
        Ok(())
    }
}
