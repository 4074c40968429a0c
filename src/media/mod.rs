//! Codec subprocess seam: probing, audio extraction, and clip cutting
//! via ffmpeg/ffprobe. Transcoding itself is a black box returning a
//! local file path.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::core::error::{PipelineError, PipelineResult};

/// Metadata extracted from a media file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn probe(&self, input: &Path) -> PipelineResult<MediaInfo>;

    /// Produce a mono 16 kHz wav next to the pipeline's temp files.
    async fn extract_audio(&self, input: &Path, output: &Path) -> PipelineResult<()>;

    /// Cut `[start, end)` seconds of `input` into `output`.
    async fn cut_clip(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        end: f64,
    ) -> PipelineResult<()>;
}

/// Clamp moment boundaries plus padding to the media's duration.
/// Returns `(clip_start, clip_end)`: never negative, never past the
/// end, and the applied padding shrinks rather than inverting the clip.
pub fn clamp_clip_bounds(
    start_time: f64,
    end_time: f64,
    padding_left: f64,
    padding_right: f64,
    duration: f64,
) -> (f64, f64) {
    let clip_start = (start_time - padding_left).max(0.0).min(duration);
    let clip_end = (end_time + padding_right).min(duration).max(clip_start);
    (clip_start, clip_end)
}

// ---- ffprobe JSON shapes ----

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

/// Parse ffprobe's `avg_frame_rate` fraction, e.g. `30000/1001`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.parse().ok(),
    }
}

fn parse_probe_output(raw: &str) -> PipelineResult<MediaInfo> {
    let probe: FfprobeOutput = serde_json::from_str(raw)
        .map_err(|e| PipelineError::Media(format!("unparseable ffprobe output: {e}")))?;

    let mut info = MediaInfo::default();
    if let Some(format) = probe.format {
        info.duration_seconds = format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0);
        info.size_bytes = format.size.as_deref().and_then(|s| s.parse().ok());
    }
    for stream in probe.streams {
        match stream.codec_type.as_deref() {
            Some("video") if info.video_codec.is_none() => {
                info.video_codec = stream.codec_name;
                info.width = stream.width;
                info.height = stream.height;
                info.fps = stream.avg_frame_rate.as_deref().and_then(parse_frame_rate);
            }
            Some("audio") if info.audio_codec.is_none() => {
                info.audio_codec = stream.codec_name;
            }
            _ => {}
        }
    }
    Ok(info)
}

/// Real codec backend shelling out to ffmpeg/ffprobe.
#[derive(Default)]
pub struct FfmpegProcessor;

impl FfmpegProcessor {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, program: &str, args: &[String]) -> PipelineResult<Vec<u8>> {
        debug!(program, ?args, "running codec subprocess");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Media(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let preview: String = stderr.chars().take(400).collect();
            return Err(PipelineError::Media(format!(
                "{program} exited with {}: {preview}",
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, input: &Path) -> PipelineResult<MediaInfo> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            path_arg(input),
        ];
        let stdout = self.run("ffprobe", &args).await?;
        parse_probe_output(&String::from_utf8_lossy(&stdout))
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path_arg(input),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            path_arg(output),
        ];
        self.run("ffmpeg", &args).await?;
        Ok(())
    }

    async fn cut_clip(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        end: f64,
    ) -> PipelineResult<()> {
        if end <= start {
            return Err(PipelineError::Media(format!(
                "empty clip range {start}..{end}"
            )));
        }
        let args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{start:.3}"),
            "-to".to_string(),
            format!("{end:.3}"),
            "-i".to_string(),
            path_arg(input),
            "-c".to_string(),
            "copy".to_string(),
            path_arg(output),
        ];
        self.run("ffmpeg", &args).await?;
        Ok(())
    }
}
