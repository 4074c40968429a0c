//! Relational-store seam.
//!
//! The durable database owns schema, foreign keys, and cascades; the
//! pipeline sees stable integer ids through this thin repository
//! interface. Inserts are idempotent by natural key where one exists
//! (`moment.identifier`, `clip.moment_id`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    core::error::{PipelineError, PipelineResult},
    protocols::transcription::{SegmentTimestamp, WordTimestamp},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: i64,
    /// The subject id.
    pub identifier: String,
    pub source_url: Option<String>,
    pub cloud_url: Option<String>,
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NewTranscript {
    pub video_id: i64,
    pub text: String,
    pub word_timestamps: Vec<WordTimestamp>,
    pub segment_timestamps: Vec<SegmentTimestamp>,
}

#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    pub id: i64,
    pub video_id: i64,
    pub text: String,
    pub word_timestamps: Vec<WordTimestamp>,
    pub segment_timestamps: Vec<SegmentTimestamp>,
}

#[derive(Debug, Clone)]
pub struct NewMoment {
    pub video_id: i64,
    /// Natural key, unique per video.
    pub identifier: String,
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
    pub is_refined: bool,
    pub parent_id: Option<i64>,
    pub generation_config_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MomentRecord {
    pub id: i64,
    pub video_id: i64,
    pub identifier: String,
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
    pub is_refined: bool,
    pub parent_id: Option<i64>,
    pub generation_config_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewClip {
    pub moment_id: i64,
    pub cloud_url: String,
    pub padding_left: f64,
    pub padding_right: f64,
}

#[derive(Debug, Clone)]
pub struct ClipRecord {
    pub id: i64,
    pub moment_id: i64,
    pub cloud_url: String,
    pub padding_left: f64,
    pub padding_right: f64,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub video_id: i64,
    /// `generation` or `refinement`.
    pub task: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct GenerationConfigRecord {
    pub id: i64,
    pub video_id: i64,
    pub model_key: String,
    pub params_json: String,
}

#[derive(Debug, Clone)]
pub struct RunHistoryRecord {
    pub id: i64,
    pub run_id: String,
    pub video_id: i64,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_moments: Option<u64>,
    pub total_clips: Option<u64>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn video_by_identifier(&self, identifier: &str) -> PipelineResult<Option<VideoRecord>>;

    async fn update_video(&self, video: &VideoRecord) -> PipelineResult<()>;

    async fn create_transcript(&self, transcript: NewTranscript)
        -> PipelineResult<TranscriptRecord>;

    async fn create_prompt(&self, prompt: NewPrompt) -> PipelineResult<i64>;

    async fn create_generation_config(
        &self,
        video_id: i64,
        model_key: &str,
        params_json: &str,
    ) -> PipelineResult<GenerationConfigRecord>;

    /// Bulk insert within one statement scope. Idempotent by
    /// `identifier`: an existing moment is returned, not duplicated.
    async fn insert_moments(&self, moments: Vec<NewMoment>) -> PipelineResult<Vec<MomentRecord>>;

    /// Idempotent by `moment_id`.
    async fn create_clip(&self, clip: NewClip) -> PipelineResult<ClipRecord>;

    async fn create_run_history(
        &self,
        run_id: &str,
        video_id: i64,
        started_at: DateTime<Utc>,
    ) -> PipelineResult<i64>;

    async fn finish_run_history(&self, record: &RunHistoryRecord) -> PipelineResult<()>;
}

#[derive(Default)]
struct CatalogInner {
    videos: Vec<VideoRecord>,
    transcripts: Vec<TranscriptRecord>,
    moments: Vec<MomentRecord>,
    clips: Vec<ClipRecord>,
    prompts: Vec<(i64, NewPrompt)>,
    generation_configs: Vec<GenerationConfigRecord>,
    run_history: Vec<RunHistoryRecord>,
    next_id: i64,
}

impl CatalogInner {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory catalog for tests and local runs.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<CatalogInner>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subject before enqueueing; mirrors the web layer
    /// creating the video row.
    pub fn add_video(&self, identifier: &str, source_url: Option<&str>) -> VideoRecord {
        let mut inner = self.inner.lock();
        let id = inner.next();
        let record = VideoRecord {
            id,
            identifier: identifier.to_string(),
            source_url: source_url.map(str::to_string),
            cloud_url: None,
            duration_seconds: None,
            width: None,
            height: None,
            fps: None,
            video_codec: None,
            audio_codec: None,
            size_bytes: None,
        };
        inner.videos.push(record.clone());
        record
    }

    pub fn moments_for_video(&self, video_id: i64) -> Vec<MomentRecord> {
        self.inner
            .lock()
            .moments
            .iter()
            .filter(|m| m.video_id == video_id)
            .cloned()
            .collect()
    }

    pub fn clips(&self) -> Vec<ClipRecord> {
        self.inner.lock().clips.clone()
    }

    pub fn transcripts(&self) -> Vec<TranscriptRecord> {
        self.inner.lock().transcripts.clone()
    }

    pub fn run_history(&self) -> Vec<RunHistoryRecord> {
        self.inner.lock().run_history.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn video_by_identifier(&self, identifier: &str) -> PipelineResult<Option<VideoRecord>> {
        Ok(self
            .inner
            .lock()
            .videos
            .iter()
            .find(|v| v.identifier == identifier)
            .cloned())
    }

    async fn update_video(&self, video: &VideoRecord) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        match inner.videos.iter_mut().find(|v| v.id == video.id) {
            Some(existing) => {
                *existing = video.clone();
                Ok(())
            }
            None => Err(PipelineError::Storage(format!(
                "no video with id {}",
                video.id
            ))),
        }
    }

    async fn create_transcript(
        &self,
        transcript: NewTranscript,
    ) -> PipelineResult<TranscriptRecord> {
        let mut inner = self.inner.lock();
        let id = inner.next();
        let record = TranscriptRecord {
            id,
            video_id: transcript.video_id,
            text: transcript.text,
            word_timestamps: transcript.word_timestamps,
            segment_timestamps: transcript.segment_timestamps,
        };
        inner.transcripts.push(record.clone());
        Ok(record)
    }

    async fn create_prompt(&self, prompt: NewPrompt) -> PipelineResult<i64> {
        let mut inner = self.inner.lock();
        let id = inner.next();
        inner.prompts.push((id, prompt));
        Ok(id)
    }

    async fn create_generation_config(
        &self,
        video_id: i64,
        model_key: &str,
        params_json: &str,
    ) -> PipelineResult<GenerationConfigRecord> {
        let mut inner = self.inner.lock();
        let id = inner.next();
        let record = GenerationConfigRecord {
            id,
            video_id,
            model_key: model_key.to_string(),
            params_json: params_json.to_string(),
        };
        inner.generation_configs.push(record.clone());
        Ok(record)
    }

    async fn insert_moments(&self, moments: Vec<NewMoment>) -> PipelineResult<Vec<MomentRecord>> {
        let mut inner = self.inner.lock();
        let mut records = Vec::with_capacity(moments.len());
        for moment in moments {
            if let Some(existing) = inner
                .moments
                .iter()
                .find(|m| m.video_id == moment.video_id && m.identifier == moment.identifier)
            {
                records.push(existing.clone());
                continue;
            }
            let id = inner.next();
            let record = MomentRecord {
                id,
                video_id: moment.video_id,
                identifier: moment.identifier,
                start_time: moment.start_time,
                end_time: moment.end_time,
                title: moment.title,
                is_refined: moment.is_refined,
                parent_id: moment.parent_id,
                generation_config_id: moment.generation_config_id,
            };
            inner.moments.push(record.clone());
            records.push(record);
        }
        Ok(records)
    }

    async fn create_clip(&self, clip: NewClip) -> PipelineResult<ClipRecord> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.clips.iter().find(|c| c.moment_id == clip.moment_id) {
            return Ok(existing.clone());
        }
        let id = inner.next();
        let record = ClipRecord {
            id,
            moment_id: clip.moment_id,
            cloud_url: clip.cloud_url,
            padding_left: clip.padding_left,
            padding_right: clip.padding_right,
        };
        inner.clips.push(record.clone());
        Ok(record)
    }

    async fn create_run_history(
        &self,
        run_id: &str,
        video_id: i64,
        started_at: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        let mut inner = self.inner.lock();
        let id = inner.next();
        inner.run_history.push(RunHistoryRecord {
            id,
            run_id: run_id.to_string(),
            video_id,
            state: "running".to_string(),
            started_at,
            completed_at: None,
            total_moments: None,
            total_clips: None,
            error_stage: None,
            error_message: None,
        });
        Ok(id)
    }

    async fn finish_run_history(&self, record: &RunHistoryRecord) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        match inner.run_history.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(PipelineError::Storage(format!(
                "no run history with id {}",
                record.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moment_insert_is_idempotent_by_identifier() {
        let catalog = MemoryCatalog::new();
        let video = catalog.add_video("vid", None);
        let moment = NewMoment {
            video_id: video.id,
            identifier: "m-0".into(),
            start_time: 1.0,
            end_time: 2.0,
            title: "One".into(),
            is_refined: false,
            parent_id: None,
            generation_config_id: None,
        };
        let first = catalog.insert_moments(vec![moment.clone()]).await.unwrap();
        let second = catalog.insert_moments(vec![moment]).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(catalog.moments_for_video(video.id).len(), 1);
    }

    #[tokio::test]
    async fn clip_insert_is_idempotent_by_moment() {
        let catalog = MemoryCatalog::new();
        let clip = NewClip {
            moment_id: 7,
            cloud_url: "https://storage.test/c".into(),
            padding_left: 30.0,
            padding_right: 30.0,
        };
        let first = catalog.create_clip(clip.clone()).await.unwrap();
        let second = catalog.create_clip(clip).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(catalog.clips().len(), 1);
    }

    #[tokio::test]
    async fn run_history_finalization() {
        let catalog = MemoryCatalog::new();
        let video = catalog.add_video("vid", None);
        let id = catalog
            .create_run_history("run-1", video.id, Utc::now())
            .await
            .unwrap();
        let mut record = catalog.run_history().remove(0);
        assert_eq!(record.id, id);
        record.state = "completed".to_string();
        record.completed_at = Some(Utc::now());
        catalog.finish_run_history(&record).await.unwrap();
        assert_eq!(catalog.run_history()[0].state, "completed");
    }
}
