//! Shared pipeline state types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed, ordered set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Download,
    AudioExtract,
    AudioUpload,
    Transcribe,
    MomentGeneration,
    ClipExtract,
    ClipUpload,
    Refinement,
}

impl StageId {
    /// Execution order. Predecessors of a stage are every stage that
    /// sorts before it here.
    pub const ORDERED: [StageId; 8] = [
        StageId::Download,
        StageId::AudioExtract,
        StageId::AudioUpload,
        StageId::Transcribe,
        StageId::MomentGeneration,
        StageId::ClipExtract,
        StageId::ClipUpload,
        StageId::Refinement,
    ];

    /// Stable name used as the field prefix in the status hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Download => "download",
            StageId::AudioExtract => "audio_extract",
            StageId::AudioUpload => "audio_upload",
            StageId::Transcribe => "transcribe",
            StageId::MomentGeneration => "moment_generation",
            StageId::ClipExtract => "clip_extract",
            StageId::ClipUpload => "clip_upload",
            StageId::Refinement => "refinement",
        }
    }

    pub fn parse(value: &str) -> Option<StageId> {
        StageId::ORDERED.iter().copied().find(|s| s.as_str() == value)
    }

    /// Declared predecessor set. The orchestrator enforces ordering by
    /// walking `ORDERED`; this documents the dependency shape.
    pub fn requires(&self) -> &'static [StageId] {
        match self {
            StageId::Download => &[],
            StageId::AudioExtract => &[StageId::Download],
            StageId::AudioUpload => &[StageId::AudioExtract],
            StageId::Transcribe => &[StageId::AudioUpload],
            StageId::MomentGeneration => &[StageId::Transcribe],
            StageId::ClipExtract => &[StageId::MomentGeneration],
            StageId::ClipUpload => &[StageId::ClipExtract],
            StageId::Refinement => &[StageId::MomentGeneration],
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage status. Transitions are monotonic:
/// pending -> running -> {completed | skipped | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<StageStatus> {
        match value {
            "pending" => Some(StageStatus::Pending),
            "running" => Some(StageStatus::Running),
            "completed" => Some(StageStatus::Completed),
            "skipped" => Some(StageStatus::Skipped),
            "failed" => Some(StageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Skipped | StageStatus::Failed
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole-run state. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<RunState> {
        match value {
            "queued" => Some(RunState::Queued),
            "running" => Some(RunState::Running),
            "completed" => Some(RunState::Completed),
            "failed" => Some(RunState::Failed),
            "cancelled" => Some(RunState::Cancelled),
            "partial" => Some(RunState::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled | RunState::Partial
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
