//! Moment generation: build the transcript-grounded prompt, call the
//! generation model, parse the moment list, and persist the results.

use async_trait::async_trait;
use tracing::info;

use super::{require_video, MomentWork, RunContext, Stage};
use crate::{
    app_context::PipelineContext,
    core::{error::PipelineResult, types::StageId},
    inference::parsing::parse_moments,
    protocols::{
        chat::ChatMessage,
        run::{RunConfig, SamplingParams},
        transcription::SegmentTimestamp,
    },
    storage::catalog::{MomentRecord, NewMoment, NewPrompt},
};

const DEFAULT_GENERATION_PROMPT: &str = "Analyze the following video transcript and identify \
the most interesting, engaging, and shareable moments. These should be self-contained segments \
that can stand alone as short video clips.";

const DEFAULT_REFINEMENT_PROMPT: &str = "Tighten the boundaries of this moment so the clip \
starts and ends on natural sentence breaks. Respond with a JSON object of the form \
{\"start_time\": <seconds>, \"end_time\": <seconds>}.";

/// Per-call sampling: run-level overrides on top of the descriptor's
/// defaults.
pub(crate) fn merge_sampling(run: &SamplingParams, descriptor: &SamplingParams) -> SamplingParams {
    SamplingParams {
        temperature: run.temperature.or(descriptor.temperature),
        top_p: run.top_p.or(descriptor.top_p),
        top_k: run.top_k.or(descriptor.top_k),
        max_tokens: run.max_tokens.or(descriptor.max_tokens),
    }
}

/// Render the generation prompt: instruction, count and length bounds,
/// then the timestamped transcript segments.
pub fn build_generation_prompt(config: &RunConfig, segments: &[SegmentTimestamp]) -> String {
    let mut prompt = config
        .generation_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_GENERATION_PROMPT.to_string());

    prompt.push_str("\n\nConstraints:\n");
    if let (Some(min), Some(max)) = (config.min_moments, config.max_moments) {
        prompt.push_str(&format!("- Return between {min} and {max} moments.\n"));
    } else if let Some(max) = config.max_moments {
        prompt.push_str(&format!("- Return at most {max} moments.\n"));
    } else if let Some(min) = config.min_moments {
        prompt.push_str(&format!("- Return at least {min} moments.\n"));
    }
    if let Some(min) = config.min_moment_length {
        prompt.push_str(&format!("- Each moment must be at least {min:.0} seconds long.\n"));
    }
    if let Some(max) = config.max_moment_length {
        prompt.push_str(&format!("- Each moment must be at most {max:.0} seconds long.\n"));
    }
    prompt.push_str(
        "- Respond with a JSON array of objects: \
         [{\"start_time\": <seconds>, \"end_time\": <seconds>, \"title\": \"...\"}].\n",
    );

    prompt.push_str("\nTranscript:\n");
    if segments.is_empty() {
        prompt.push_str("(no speech detected)\n");
    }
    for segment in segments {
        prompt.push_str(&format!(
            "[{:.1} - {:.1}] {}\n",
            segment.start, segment.end, segment.text
        ));
    }
    prompt
}

/// Render the refinement prompt for one moment. The clip itself is
/// attached as a `video_url` part when the model supports it.
pub fn build_refinement_prompt(config: &RunConfig, moment: &MomentRecord) -> String {
    let mut prompt = config
        .refinement_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_REFINEMENT_PROMPT.to_string());
    prompt.push_str(&format!(
        "\n\nMoment: \"{}\" currently spans {:.1}s to {:.1}s.",
        moment.title, moment.start_time, moment.end_time
    ));
    prompt
}

pub struct MomentGenerationStage;

#[async_trait]
impl Stage for MomentGenerationStage {
    fn id(&self) -> StageId {
        StageId::MomentGeneration
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
        let config = ctx.request.config.clone();
        let segments = ctx
            .transcript
            .as_ref()
            .map(|t| t.segment_timestamps.clone())
            .unwrap_or_default();

        let descriptor = app.registry.get(&config.generation_model).await?;
        let sampling = merge_sampling(&config.generation_params, &descriptor.sampling);
        let prompt = build_generation_prompt(&config, &segments);

        app.catalog
            .create_prompt(NewPrompt {
                video_id: video.id,
                task: "generation".to_string(),
                text: prompt.clone(),
            })
            .await?;
        let generation_config = app
            .catalog
            .create_generation_config(
                video.id,
                &config.generation_model,
                &serde_json::to_string(&sampling).unwrap_or_default(),
            )
            .await?;

        let handle = app.tunnels.acquire(&config.generation_model, &ctx.cancel).await?;
        let result = app
            .inference
            .chat_complete(
                &handle,
                descriptor.model_id.as_deref(),
                vec![ChatMessage::user(prompt)],
                &sampling,
                &ctx.cancel,
            )
            .await;
        handle.release().await;
        let result = result?;

        let spans = parse_moments(&result.content)?;
        info!(
            subject_id = %ctx.subject_id(),
            moments = spans.len(),
            model_key = %config.generation_model,
            "moment generation parsed"
        );

        // Zero moments is a completed stage; downstream stages run over
        // the empty set as no-ops.
        let new_moments: Vec<NewMoment> = spans
            .iter()
            .enumerate()
            .map(|(index, span)| NewMoment {
                video_id: video.id,
                identifier: format!("{}-m{index}", ctx.request.run_id),
                start_time: span.start_time,
                end_time: span.end_time,
                title: span.title.clone(),
                is_refined: false,
                parent_id: None,
                generation_config_id: Some(generation_config.id),
            })
            .collect();
        let records = app.catalog.insert_moments(new_moments).await?;

        ctx.generation_config_id = Some(generation_config.id);
        ctx.moments = records.into_iter().map(MomentWork::new).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments() -> Vec<SegmentTimestamp> {
        vec![
            SegmentTimestamp {
                text: "welcome back".into(),
                start: 0.0,
                end: 2.5,
            },
            SegmentTimestamp {
                text: "today we ship".into(),
                start: 2.5,
                end: 5.0,
            },
        ]
    }

    #[test]
    fn prompt_includes_bounds_and_segments() {
        let mut config = RunConfig::new("vl", "vl");
        config.min_moments = Some(3);
        config.max_moments = Some(10);
        config.min_moment_length = Some(60.0);
        let prompt = build_generation_prompt(&config, &segments());
        assert!(prompt.contains("between 3 and 10 moments"));
        assert!(prompt.contains("at least 60 seconds"));
        assert!(prompt.contains("[0.0 - 2.5] welcome back"));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn empty_transcript_is_stated_not_omitted() {
        let config = RunConfig::new("vl", "vl");
        let prompt = build_generation_prompt(&config, &[]);
        assert!(prompt.contains("(no speech detected)"));
    }

    #[test]
    fn custom_prompt_replaces_default_instruction() {
        let mut config = RunConfig::new("vl", "vl");
        config.generation_prompt = Some("Find the funniest bits.".into());
        let prompt = build_generation_prompt(&config, &segments());
        assert!(prompt.starts_with("Find the funniest bits."));
        assert!(!prompt.contains("shareable moments"));
    }

    #[test]
    fn sampling_merge_prefers_run_overrides() {
        let run = SamplingParams {
            temperature: Some(0.2),
            ..SamplingParams::default()
        };
        let descriptor = SamplingParams {
            temperature: Some(0.7),
            top_p: Some(0.95),
            top_k: Some(20),
            max_tokens: None,
        };
        let merged = merge_sampling(&run, &descriptor);
        assert_eq!(merged.temperature, Some(0.2));
        assert_eq!(merged.top_p, Some(0.95));
        assert_eq!(merged.top_k, Some(20));
    }
}
