//! Transcription service wire shapes.

use serde::{Deserialize, Serialize};

/// Word-level timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Segment-level timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentTimestamp {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Response of the transcription endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub transcription: String,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
    #[serde(default)]
    pub segment_timestamps: Vec<SegmentTimestamp>,
    #[serde(default)]
    pub processing_time: f64,
}

impl TranscriptResult {
    /// Zero segments is a valid, completed transcription.
    pub fn is_empty(&self) -> bool {
        self.transcription.trim().is_empty() && self.segment_timestamps.is_empty()
    }
}
