//! Inference client: chat completions and transcription through an
//! acquired tunnel handle.

pub mod parsing;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::types::InferenceTimeouts,
    core::{
        error::{PipelineError, PipelineResult},
        retry::{backoff_delay, is_retryable_status},
    },
    protocols::{
        chat::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage},
        run::SamplingParams,
        transcription::TranscriptResult,
    },
    tunnel::TunnelHandle,
};

/// Assistant output of one chat completion.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
    pub model: Option<String>,
}

#[async_trait]
pub trait Inference: Send + Sync {
    async fn chat_complete(
        &self,
        handle: &TunnelHandle,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        sampling: &SamplingParams,
        cancel: &CancellationToken,
    ) -> PipelineResult<ChatResult>;

    async fn transcribe(
        &self,
        handle: &TunnelHandle,
        audio_file: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<TranscriptResult>;
}

pub struct HttpInferenceClient {
    client: reqwest::Client,
    timeouts: InferenceTimeouts,
}

impl HttpInferenceClient {
    pub fn new(timeouts: InferenceTimeouts) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| PipelineError::Network {
                context: "http client".into(),
                message: e.to_string(),
            })?;
        Ok(Self { client, timeouts })
    }

    /// Send with a single transport-level retry on connection failure
    /// or retryable status. No retry on 4xx, parse errors, or cancel.
    async fn send_with_retry(
        &self,
        url: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> PipelineResult<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            let request = build();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = request.send() => result,
            };

            match response {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if is_retryable_status(status) && attempt == 0 {
                        warn!(url, %status, "retrying inference call once");
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        let preview: String = body.chars().take(200).collect();
                        return Err(PipelineError::Network {
                            context: url.to_string(),
                            message: format!("HTTP {status}: {preview}"),
                        });
                    }
                }
                Err(err) => {
                    let transient = err.is_connect() || err.is_timeout();
                    if !(transient && attempt == 0) {
                        return Err(PipelineError::Network {
                            context: url.to_string(),
                            message: err.to_string(),
                        });
                    }
                    warn!(url, error = %err, "retrying inference call once");
                }
            }

            attempt += 1;
            let delay = backoff_delay(self.timeouts.retry_backoff, 0);
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl Inference for HttpInferenceClient {
    async fn chat_complete(
        &self,
        handle: &TunnelHandle,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        sampling: &SamplingParams,
        cancel: &CancellationToken,
    ) -> PipelineResult<ChatResult> {
        let url = handle.endpoint_url();
        let body = ChatCompletionRequest::new(model_id.map(str::to_string), messages, sampling);
        let payload = serde_json::to_value(&body).map_err(|e| PipelineError::Network {
            context: url.clone(),
            message: format!("unserializable request: {e}"),
        })?;

        let response = self
            .send_with_retry(
                &url,
                || {
                    self.client
                        .post(&url)
                        .timeout(self.timeouts.chat)
                        .json(&payload)
                },
                cancel,
            )
            .await?;

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| PipelineError::Network {
                context: url.clone(),
                message: format!("invalid JSON body: {e}"),
            })?;

        let content = parsed
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::InferenceParse("response has no content".into()))?;

        info!(
            model_key = handle.model_key(),
            chars = content.len(),
            "chat completion received"
        );
        Ok(ChatResult {
            content,
            model: parsed.model,
        })
    }

    async fn transcribe(
        &self,
        handle: &TunnelHandle,
        audio_file: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<TranscriptResult> {
        let url = handle.endpoint_url();
        let bytes = tokio::fs::read(audio_file).await?;
        let file_name = audio_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        let response = self
            .send_with_retry(
                &url,
                || {
                    let part = reqwest::multipart::Part::bytes(bytes.clone())
                        .file_name(file_name.clone());
                    let form = reqwest::multipart::Form::new().part("file", part);
                    self.client
                        .post(&url)
                        .timeout(self.timeouts.transcription)
                        .multipart(form)
                },
                cancel,
            )
            .await?;

        let result: TranscriptResult =
            response.json().await.map_err(|e| PipelineError::Network {
                context: url.clone(),
                message: format!("invalid JSON body: {e}"),
            })?;

        info!(
            model_key = handle.model_key(),
            words = result.word_timestamps.len(),
            segments = result.segment_timestamps.len(),
            "transcription received"
        );
        Ok(result)
    }
}
