//! Moment refinement: per-moment boundary tightening by the refinement
//! model, with the clip attached when the model accepts video. Each
//! moment is an independent, recoverable unit; originals stay intact.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{build_refinement_prompt, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        governor::Resource,
        types::StageId,
    },
    inference::parsing::parse_refinement,
    protocols::chat::{ChatMessage, ContentPart},
    stages::generation::merge_sampling,
    storage::catalog::NewMoment,
    tunnel::TunnelHandle,
};

pub struct RefinementStage;

#[async_trait]
impl Stage for RefinementStage {
    fn id(&self) -> StageId {
        StageId::Refinement
    }

    async fn should_skip(
        &self,
        _app: &PipelineContext,
        _ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>> {
        Ok(None)
    }

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()> {
        let to_refine: Vec<usize> = (0..ctx.moments.len())
            .filter(|&i| !ctx.moments[i].record.is_refined)
            .collect();
        if to_refine.is_empty() {
            info!(subject_id = %ctx.subject_id(), "no moments; nothing to refine");
            return Ok(());
        }

        let config = ctx.request.config.clone();
        let descriptor = app.registry.get(&config.refinement_model).await?;
        let sampling = merge_sampling(&config.generation_params, &descriptor.sampling);
        let total = to_refine.len();
        app.status
            .set_refinement_progress(ctx.subject_id(), total, 0, 0)
            .await?;

        // One tunnel for the whole stage; an endpoint that cannot come
        // up degrades the run to partial instead of failing it.
        let handle = match app.tunnels.acquire(&config.refinement_model, &ctx.cancel).await {
            Ok(handle) => handle,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err @ PipelineError::TunnelReadinessTimeout { .. }) => {
                ctx.recoverable_failures += total;
                return Err(PipelineError::Recoverable(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        let result = self
            .refine_all(app, ctx, &handle, &descriptor.model_id, &sampling, &to_refine)
            .await;
        handle.release().await;
        result
    }
}

impl RefinementStage {
    async fn refine_all(
        &self,
        app: &PipelineContext,
        ctx: &mut RunContext,
        handle: &TunnelHandle,
        model_id: &Option<String>,
        sampling: &crate::protocols::run::SamplingParams,
        to_refine: &[usize],
    ) -> PipelineResult<()> {
        let subject_id = ctx.subject_id().to_string();
        let config = ctx.request.config.clone();
        let supports_video = app
            .registry
            .get(&config.refinement_model)
            .await?
            .supports_video;
        let total = to_refine.len();
        let mut processed = 0usize;
        let mut successful = 0usize;

        for &index in to_refine {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let permit = app.governor.acquire(Resource::Refinement, &ctx.cancel).await?;

            let (record, clip_url) = {
                let work = &ctx.moments[index];
                (work.record.clone(), work.clip_url.clone())
            };
            let prompt = build_refinement_prompt(&config, &record);
            let message = match (&clip_url, supports_video) {
                (Some(url), true) => ChatMessage::user_parts(vec![
                    ContentPart::text(prompt),
                    ContentPart::video_url(url.clone()),
                ]),
                _ => ChatMessage::user(prompt),
            };

            let outcome = async {
                let result = app
                    .inference
                    .chat_complete(
                        handle,
                        model_id.as_deref(),
                        vec![message],
                        sampling,
                        &ctx.cancel,
                    )
                    .await?;
                let span = parse_refinement(&result.content)?;
                let refined = app
                    .catalog
                    .insert_moments(vec![NewMoment {
                        video_id: record.video_id,
                        identifier: format!("{}-refined", record.identifier),
                        start_time: span.start_time,
                        end_time: span.end_time,
                        title: record.title.clone(),
                        is_refined: true,
                        parent_id: Some(record.id),
                        generation_config_id: record.generation_config_id,
                    }])
                    .await?;
                Ok::<_, PipelineError>(refined)
            }
            .await;
            drop(permit);

            processed += 1;
            match outcome {
                Ok(_) => successful += 1,
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    // The original moment remains intact.
                    ctx.recoverable_failures += 1;
                    warn!(
                        subject_id,
                        moment = %record.identifier,
                        error = %err,
                        "refinement failed for one moment"
                    );
                }
            }
            app.status
                .set_refinement_progress(&subject_id, total, processed, successful)
                .await?;
        }

        info!(subject_id, successful, total, "refinement finished");
        Ok(())
    }
}
