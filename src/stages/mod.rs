//! Stage runtime: the polymorphic stage abstraction and the per-run
//! context that threads outputs forward.

mod audio_extract;
mod audio_upload;
mod clip_extract;
mod clip_upload;
mod download;
mod generation;
mod refinement;
mod transcribe;

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::PipelineContext,
    core::{
        error::{PipelineError, PipelineResult},
        types::StageId,
    },
    media::MediaInfo,
    protocols::run::RunRequest,
    storage::catalog::{MomentRecord, TranscriptRecord, VideoRecord},
};

pub use generation::{build_generation_prompt, build_refinement_prompt};

/// Per-moment working state carried between the clip and refinement
/// stages.
#[derive(Debug, Clone)]
pub struct MomentWork {
    pub record: MomentRecord,
    pub clip_path: Option<PathBuf>,
    pub clip_url: Option<String>,
    /// Padding actually applied after clamping to media bounds,
    /// `(left, right)`.
    pub applied_padding: Option<(f64, f64)>,
    /// Set when clip extraction or upload failed for this moment; the
    /// refinement stage falls back to the text-only path.
    pub clip_failed: bool,
}

impl MomentWork {
    pub fn new(record: MomentRecord) -> Self {
        Self {
            record,
            clip_path: None,
            clip_url: None,
            applied_padding: None,
            clip_failed: false,
        }
    }
}

/// Mutable state of one run. The context is the only medium by which
/// stage outputs flow forward.
pub struct RunContext {
    pub request: RunRequest,
    pub cancel: CancellationToken,
    /// Scratch directory; removed with the context.
    pub temp: tempfile::TempDir,
    pub video: Option<VideoRecord>,
    pub media_info: Option<MediaInfo>,
    pub local_video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub audio_url: Option<String>,
    pub transcript: Option<TranscriptRecord>,
    pub generation_config_id: Option<i64>,
    pub moments: Vec<MomentWork>,
    /// Per-item failures that degrade the run to `partial`.
    pub recoverable_failures: usize,
}

impl RunContext {
    pub fn new(
        request: RunRequest,
        cancel: CancellationToken,
        temp_root: &std::path::Path,
    ) -> PipelineResult<Self> {
        std::fs::create_dir_all(temp_root)?;
        let temp = tempfile::Builder::new()
            .prefix(&format!("run-{}-", request.subject_id))
            .tempdir_in(temp_root)?;
        Ok(Self {
            request,
            cancel,
            temp,
            video: None,
            media_info: None,
            local_video_path: None,
            audio_path: None,
            audio_url: None,
            transcript: None,
            generation_config_id: None,
            moments: Vec::new(),
            recoverable_failures: 0,
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.request.subject_id
    }

    pub fn video(&self) -> PipelineResult<&VideoRecord> {
        self.video
            .as_ref()
            .ok_or_else(|| PipelineError::Storage("subject record not loaded".into()))
    }

    /// Media duration: from the probe when this run touched the file,
    /// else from persisted subject metadata.
    pub fn duration(&self) -> PipelineResult<f64> {
        if let Some(info) = &self.media_info {
            return Ok(info.duration_seconds);
        }
        self.video
            .as_ref()
            .and_then(|v| v.duration_seconds)
            .ok_or_else(|| PipelineError::Media("media duration unknown".into()))
    }
}

/// One named unit of work within a run.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Evaluated before any resource acquisition. `Some(reason)` skips
    /// the stage. Takes the context mutably so lookups (subject record,
    /// descriptors) can be cached for the stages that follow.
    async fn should_skip(
        &self,
        app: &PipelineContext,
        ctx: &mut RunContext,
    ) -> PipelineResult<Option<String>>;

    async fn run(&self, app: &PipelineContext, ctx: &mut RunContext) -> PipelineResult<()>;
}

/// The fixed stage sequence the orchestrator walks.
pub fn ordered_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(download::DownloadStage),
        Box::new(audio_extract::AudioExtractStage),
        Box::new(audio_upload::AudioUploadStage),
        Box::new(transcribe::TranscribeStage),
        Box::new(generation::MomentGenerationStage),
        Box::new(clip_extract::ClipExtractStage),
        Box::new(clip_upload::ClipUploadStage),
        Box::new(refinement::RefinementStage),
    ]
}

/// Whether the refinement model can consume clip video. Drives the
/// ClipExtract/ClipUpload skip rule.
pub(crate) async fn refinement_supports_video(
    app: &PipelineContext,
    ctx: &RunContext,
) -> PipelineResult<bool> {
    let descriptor = app.registry.get(&ctx.request.config.refinement_model).await?;
    Ok(descriptor.supports_video)
}

/// Load and cache the subject's catalog record.
pub(crate) async fn require_video(
    app: &PipelineContext,
    ctx: &mut RunContext,
) -> PipelineResult<VideoRecord> {
    if let Some(video) = &ctx.video {
        return Ok(video.clone());
    }
    let video = app
        .catalog
        .video_by_identifier(&ctx.request.subject_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Storage(format!("unknown subject: {}", ctx.request.subject_id))
        })?;
    ctx.video = Some(video.clone());
    Ok(video)
}

/// Fetch a URL to a local file, observing cancellation per chunk.
pub(crate) async fn fetch_to_file(
    http: &reqwest::Client,
    url: &str,
    path: &std::path::Path,
    cancel: &CancellationToken,
) -> PipelineResult<u64> {
    use tokio::io::AsyncWriteExt;

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        result = http.get(url).send() => result.map_err(|e| PipelineError::Network {
            context: url.to_string(),
            message: e.to_string(),
        })?,
    };
    if !response.status().is_success() {
        return Err(PipelineError::Network {
            context: url.to_string(),
            message: format!("HTTP {}", response.status()),
        });
    }

    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            Some(Err(e)) => {
                return Err(PipelineError::Network {
                    context: url.to_string(),
                    message: e.to_string(),
                })
            }
            None => break,
        }
    }
    file.flush().await?;
    Ok(written)
}

/// Make sure the run has a local copy of the source media, fetching the
/// registered cloud copy when the download stage was skipped.
pub(crate) async fn ensure_local_media(
    app: &PipelineContext,
    ctx: &mut RunContext,
) -> PipelineResult<PathBuf> {
    if let Some(path) = &ctx.local_video_path {
        return Ok(path.clone());
    }
    let video = ctx.video()?.clone();
    let path = ctx.temp.path().join(format!("{}.mp4", ctx.subject_id()));

    let url = if let Some(key) = &video.cloud_url {
        app.artifacts
            .signed_url(key, app.config.signed_url_ttl)
            .await?
    } else if let Some(source) = &video.source_url {
        source.clone()
    } else {
        return Err(PipelineError::Storage(format!(
            "subject {} has neither a cloud copy nor a source URL",
            video.identifier
        )));
    };

    fetch_to_file(&app.http, &url, &path, &ctx.cancel).await?;
    if ctx.media_info.is_none() {
        ctx.media_info = Some(app.media.probe(&path).await?);
    }
    ctx.local_video_path = Some(path.clone());
    Ok(path)
}
