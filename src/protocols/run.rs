//! Run submission shapes: the stream record and its embedded config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{PipelineError, PipelineResult};

/// Sampling parameters forwarded to generation and refinement calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Per-run configuration supplied at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub generation_model: String,
    pub refinement_model: String,
    #[serde(default)]
    pub generation_params: SamplingParams,
    #[serde(default = "default_padding")]
    pub padding_left_seconds: f64,
    #[serde(default = "default_padding")]
    pub padding_right_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_moments: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_moments: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_moment_length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_moment_length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement_prompt: Option<String>,
    /// Re-download the source even when a cloud copy is registered.
    #[serde(default)]
    pub force_download: bool,
}

fn default_padding() -> f64 {
    30.0
}

impl RunConfig {
    pub fn new(generation_model: impl Into<String>, refinement_model: impl Into<String>) -> Self {
        Self {
            generation_model: generation_model.into(),
            refinement_model: refinement_model.into(),
            generation_params: SamplingParams::default(),
            padding_left_seconds: default_padding(),
            padding_right_seconds: default_padding(),
            min_moments: None,
            max_moments: None,
            min_moment_length: None,
            max_moment_length: None,
            generation_prompt: None,
            refinement_prompt: None,
            force_download: false,
        }
    }

    /// Numeric sanity checks applied at enqueue. Model-key existence is
    /// checked separately against the registry.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.generation_model.is_empty() {
            return Err(PipelineError::Validation(
                "generation_model must not be empty".into(),
            ));
        }
        if self.refinement_model.is_empty() {
            return Err(PipelineError::Validation(
                "refinement_model must not be empty".into(),
            ));
        }
        if self.padding_left_seconds < 0.0 || self.padding_right_seconds < 0.0 {
            return Err(PipelineError::Validation(
                "padding must not be negative".into(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_moments, self.max_moments) {
            if min > max {
                return Err(PipelineError::Validation(format!(
                    "min_moments ({min}) exceeds max_moments ({max})"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_moment_length, self.max_moment_length) {
            if min > max {
                return Err(PipelineError::Validation(format!(
                    "min_moment_length ({min}) exceeds max_moment_length ({max})"
                )));
            }
        }
        if self.min_moment_length.is_some_and(|v| v <= 0.0)
            || self.max_moment_length.is_some_and(|v| v <= 0.0)
        {
            return Err(PipelineError::Validation(
                "moment length bounds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One entry on the `pipeline:requests` stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub run_id: String,
    pub subject_id: String,
    pub config: RunConfig,
    pub requested_at: DateTime<Utc>,
}

impl RunRequest {
    pub fn new(subject_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            config,
            requested_at: Utc::now(),
        }
    }

    /// Flat field representation for `XADD`. The config travels as one
    /// JSON field so the stream schema stays stable as fields grow.
    pub fn to_fields(&self) -> PipelineResult<Vec<(String, String)>> {
        let config = serde_json::to_string(&self.config)
            .map_err(|e| PipelineError::Validation(format!("unserializable config: {e}")))?;
        Ok(vec![
            ("run_id".to_string(), self.run_id.clone()),
            ("subject_id".to_string(), self.subject_id.clone()),
            ("config".to_string(), config),
            ("requested_at".to_string(), self.requested_at.to_rfc3339()),
        ])
    }

    /// Decode a stream entry's field map. Entries missing required
    /// fields are malformed and rejected.
    pub fn from_fields(fields: &[(String, String)]) -> PipelineResult<Self> {
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| PipelineError::Validation(format!("stream entry missing '{name}'")))
        };

        let config: RunConfig = serde_json::from_str(lookup("config")?)
            .map_err(|e| PipelineError::Validation(format!("bad config payload: {e}")))?;
        let requested_at = DateTime::parse_from_rfc3339(lookup("requested_at")?)
            .map_err(|e| PipelineError::Validation(format!("bad requested_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            run_id: lookup("run_id")?.to_string(),
            subject_id: lookup("subject_id")?.to_string(),
            config,
            requested_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::new("vl", "text_only")
    }

    #[test]
    fn defaults_apply_thirty_second_padding() {
        let cfg = config();
        assert_eq!(cfg.padding_left_seconds, 30.0);
        assert_eq!(cfg.padding_right_seconds, 30.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn inverted_moment_bounds_rejected() {
        let mut cfg = config();
        cfg.min_moments = Some(10);
        cfg.max_moments = Some(3);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_padding_rejected() {
        let mut cfg = config();
        cfg.padding_left_seconds = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stream_fields_round_trip() {
        let request = RunRequest::new("vid-9", config());
        let fields = request.to_fields().unwrap();
        let decoded = RunRequest::from_fields(&fields).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn missing_field_is_rejected() {
        let request = RunRequest::new("vid-9", config());
        let mut fields = request.to_fields().unwrap();
        fields.retain(|(k, _)| k != "config");
        assert!(RunRequest::from_fields(&fields).is_err());
    }

    #[test]
    fn config_json_ignores_unknown_ordering() {
        let raw = r#"{
            "generation_model": "vl",
            "refinement_model": "vl",
            "min_moments": 3,
            "max_moments": 10
        }"#;
        let cfg: RunConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.min_moments, Some(3));
        assert!(!cfg.force_download);
    }
}
