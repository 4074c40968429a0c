//! Model registry: per-model connection descriptors persisted in the
//! coordination store under `model:config:*`.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    core::{
        error::{PipelineError, PipelineResult},
        keys,
    },
    data_connector::CoordStore,
    protocols::run::SamplingParams,
};

/// How a model endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Ssh port forward to the remote host (default).
    #[default]
    Tunnel,
    /// Plain HTTP straight to the service.
    Direct,
}

impl ConnectionMode {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Tunnel => "tunnel",
            ConnectionMode::Direct => "direct",
        }
    }

    fn parse(value: &str) -> ConnectionMode {
        match value {
            "direct" => ConnectionMode::Direct,
            _ => ConnectionMode::Tunnel,
        }
    }
}

/// Connection and capability record for one model key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub key: String,
    pub name: String,
    /// Model identifier sent in requests; some deployments infer it.
    pub model_id: Option<String>,
    pub ssh_host: String,
    pub ssh_user: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// Path appended to the handle's base URL, e.g. `/v1/chat/completions`.
    pub endpoint_path: String,
    pub supports_video: bool,
    pub connection_mode: ConnectionMode,
    pub direct_host: Option<String>,
    pub direct_port: Option<u16>,
    /// Defaults merged under per-run sampling overrides.
    pub sampling: SamplingParams,
}

impl ModelDescriptor {
    /// Hash encoding. Values are stored as strings; empty string means
    /// absent.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let set = |v: &Option<String>| v.clone().unwrap_or_default();
        let num = |v: Option<u16>| v.map(|p| p.to_string()).unwrap_or_default();
        vec![
            ("key".into(), self.key.clone()),
            ("name".into(), self.name.clone()),
            ("model_id".into(), set(&self.model_id)),
            ("ssh_host".into(), self.ssh_host.clone()),
            ("ssh_user".into(), self.ssh_user.clone()),
            ("local_port".into(), self.local_port.to_string()),
            ("remote_host".into(), self.remote_host.clone()),
            ("remote_port".into(), self.remote_port.to_string()),
            ("endpoint_path".into(), self.endpoint_path.clone()),
            ("supports_video".into(), self.supports_video.to_string()),
            ("connection_mode".into(), self.connection_mode.as_str().into()),
            ("direct_host".into(), set(&self.direct_host)),
            ("direct_port".into(), num(self.direct_port)),
            (
                "temperature".into(),
                self.sampling
                    .temperature
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            (
                "top_p".into(),
                self.sampling.top_p.map(|v| v.to_string()).unwrap_or_default(),
            ),
            (
                "top_k".into(),
                self.sampling.top_k.map(|v| v.to_string()).unwrap_or_default(),
            ),
            (
                "max_tokens".into(),
                self.sampling
                    .max_tokens
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
        ]
    }

    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> PipelineResult<Self> {
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let opt = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
        let port = |name: &str| -> PipelineResult<u16> {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "descriptor '{key}' has invalid field '{name}'"
                    ))
                })
        };
        let opt_port = |name: &str| opt(name).and_then(|v| v.parse::<u16>().ok());

        Ok(Self {
            key: key.to_string(),
            name: text("name"),
            model_id: opt("model_id"),
            ssh_host: text("ssh_host"),
            ssh_user: text("ssh_user"),
            local_port: port("local_port")?,
            remote_host: text("remote_host"),
            remote_port: port("remote_port")?,
            endpoint_path: text("endpoint_path"),
            supports_video: text("supports_video") == "true",
            connection_mode: ConnectionMode::parse(&text("connection_mode")),
            direct_host: opt("direct_host"),
            direct_port: opt_port("direct_port"),
            sampling: SamplingParams {
                temperature: opt("temperature").and_then(|v| v.parse().ok()),
                top_p: opt("top_p").and_then(|v| v.parse().ok()),
                top_k: opt("top_k").and_then(|v| v.parse().ok()),
                max_tokens: opt("max_tokens").and_then(|v| v.parse().ok()),
            },
        })
    }
}

/// Registry client. Reads go to the store each time; descriptors are
/// small and updates from the admin surface must be visible mid-run.
pub struct ModelRegistry {
    store: Arc<dyn CoordStore>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, model_key: &str) -> PipelineResult<ModelDescriptor> {
        let fields = self.store.hash_get_all(&keys::model_config(model_key)).await?;
        if fields.is_empty() {
            let available = self.registered_keys().await?;
            return Err(PipelineError::ModelNotRegistered {
                model_key: model_key.to_string(),
                available,
            });
        }
        ModelDescriptor::from_fields(model_key, &fields)
    }

    pub async fn list(&self) -> PipelineResult<Vec<ModelDescriptor>> {
        let mut descriptors = Vec::new();
        for key in self.registered_keys().await? {
            descriptors.push(self.get(&key).await?);
        }
        Ok(descriptors)
    }

    pub async fn upsert(&self, descriptor: &ModelDescriptor) -> PipelineResult<()> {
        self.store
            .hash_set(&keys::model_config(&descriptor.key), &descriptor.to_fields())
            .await?;
        self.store.set_add(keys::MODEL_KEYS, &descriptor.key).await?;
        Ok(())
    }

    /// Partial field update; unknown fields are stored verbatim so new
    /// descriptor fields can roll out before this binary knows them.
    pub async fn update(&self, model_key: &str, fields: &[(String, String)]) -> PipelineResult<()> {
        // Reject updates to unregistered keys rather than creating
        // half-formed descriptors.
        self.get(model_key).await?;
        self.store
            .hash_set(&keys::model_config(model_key), fields)
            .await?;
        Ok(())
    }

    pub async fn registered_keys(&self) -> PipelineResult<Vec<String>> {
        let mut keys = self.store.set_members(keys::MODEL_KEYS).await?;
        keys.sort();
        Ok(keys)
    }

    /// Seed default descriptors when the registry is empty. Runs at
    /// worker startup; a populated registry is left untouched.
    pub async fn seed_defaults(&self) -> PipelineResult<()> {
        if !self.registered_keys().await?.is_empty() {
            return Ok(());
        }
        for descriptor in default_descriptors() {
            info!(model_key = %descriptor.key, "seeding default model descriptor");
            self.upsert(&descriptor).await?;
        }
        Ok(())
    }
}

/// Built-in descriptors for a fresh deployment: a video-capable
/// generation/refinement model, a text-only fallback, and the
/// transcription service.
pub fn default_descriptors() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            key: "qwen3_vl".into(),
            name: "Qwen3-VL".into(),
            model_id: None,
            ssh_host: "inference-gateway".into(),
            ssh_user: "pipeline".into(),
            local_port: 6010,
            remote_host: "gpu-worker-9".into(),
            remote_port: 8010,
            endpoint_path: "/v1/chat/completions".into(),
            supports_video: true,
            connection_mode: ConnectionMode::Tunnel,
            direct_host: None,
            direct_port: None,
            sampling: SamplingParams {
                temperature: Some(0.7),
                ..SamplingParams::default()
            },
        },
        ModelDescriptor {
            key: "qwen3_text".into(),
            name: "Qwen3-Text".into(),
            model_id: None,
            ssh_host: "inference-gateway".into(),
            ssh_user: "pipeline".into(),
            local_port: 7101,
            remote_host: "gpu-worker-9".into(),
            remote_port: 8002,
            endpoint_path: "/v1/chat/completions".into(),
            supports_video: false,
            connection_mode: ConnectionMode::Tunnel,
            direct_host: None,
            direct_port: None,
            sampling: SamplingParams {
                temperature: Some(0.7),
                top_p: Some(0.95),
                top_k: Some(20),
                max_tokens: None,
            },
        },
        ModelDescriptor {
            key: "parakeet".into(),
            name: "Parakeet ASR".into(),
            model_id: None,
            ssh_host: "inference-gateway".into(),
            ssh_user: "pipeline".into(),
            local_port: 6106,
            remote_host: "gpu-worker-9".into(),
            remote_port: 8006,
            endpoint_path: "/transcribe".into(),
            supports_video: false,
            connection_mode: ConnectionMode::Tunnel,
            direct_host: None,
            direct_port: None,
            sampling: SamplingParams::default(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_connector::MemoryCoordStore;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(MemoryCoordStore::new()))
    }

    #[tokio::test]
    async fn unknown_key_reports_available_models() {
        let registry = registry();
        registry.seed_defaults().await.unwrap();
        let err = registry.get("nope").await.unwrap_err();
        match err {
            PipelineError::ModelNotRegistered { model_key, available } => {
                assert_eq!(model_key, "nope");
                assert!(available.contains(&"qwen3_vl".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn descriptor_round_trips_through_hash() {
        let registry = registry();
        let descriptor = default_descriptors().remove(0);
        registry.upsert(&descriptor).await.unwrap();
        let loaded = registry.get(&descriptor.key).await.unwrap();
        assert_eq!(loaded, descriptor);
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_preserves_edits() {
        let registry = registry();
        registry.seed_defaults().await.unwrap();
        registry
            .update("qwen3_vl", &[("supports_video".into(), "false".into())])
            .await
            .unwrap();
        registry.seed_defaults().await.unwrap();
        let loaded = registry.get("qwen3_vl").await.unwrap();
        assert!(!loaded.supports_video);
    }

    #[tokio::test]
    async fn update_rejects_unregistered_key() {
        let registry = registry();
        let result = registry
            .update("ghost", &[("name".into(), "Ghost".into())])
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::ModelNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn list_returns_all_seeded() {
        let registry = registry();
        registry.seed_defaults().await.unwrap();
        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|d| d.endpoint_path == "/transcribe"));
    }
}
