//! OpenAI-compatible chat-completion wire shapes.
//!
//! Only the subset the inference endpoints actually exchange: text and
//! `video_url` content parts on the way in, choice/message content on
//! the way out.

use serde::{Deserialize, Serialize};

use crate::protocols::run::SamplingParams;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    VideoUrl { video_url: VideoUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn video_url(url: impl Into<String>) -> Self {
        ContentPart::VideoUrl {
            video_url: VideoUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoUrl {
    pub url: String,
}

/// Message content: plain string or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(parts),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(content.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    /// Some endpoints infer the model from the deployment; the field is
    /// omitted when the descriptor has no model id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    pub fn new(
        model: Option<String>,
        messages: Vec<ChatMessage>,
        sampling: &SamplingParams,
    ) -> Self {
        Self {
            model,
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_tokens: sampling.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: AssistantMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_part_serializes_with_tag() {
        let part = ContentPart::video_url("https://cdn.example/clip.mp4");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "video_url");
        assert_eq!(json["video_url"]["url"], "https://cdn.example/clip.mp4");
    }

    #[test]
    fn request_omits_absent_sampling_fields() {
        let request = ChatCompletionRequest::new(
            None,
            vec![ChatMessage::user("hello")],
            &SamplingParams {
                temperature: Some(0.7),
                ..SamplingParams::default()
            },
        );
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("top_p").is_none());
        assert_eq!(json["temperature"], 0.7);
    }

    #[test]
    fn response_content_extraction() {
        let raw = r#"{
            "choices": [{"message": {"content": "[]"}, "finish_reason": "stop"}],
            "model": "qwen3-vl"
        }"#;
        let response: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.first_content(), Some("[]"));
    }

    #[test]
    fn empty_choices_yield_no_content() {
        let response: ChatCompletionResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.first_content(), None);
    }
}
