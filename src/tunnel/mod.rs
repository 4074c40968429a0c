//! On-demand network forwards to remote inference endpoints.
//!
//! `acquire` resolves the model descriptor, starts an ssh port forward,
//! probes the local port until it accepts connections, and returns a
//! handle scoped to the call site. Release happens on every exit path:
//! explicitly via [`TunnelHandle::release`], or from `Drop`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::{net::TcpStream, process::Child, process::Command, sync::OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::types::TunnelSettings,
    core::error::{PipelineError, PipelineResult},
    registry::{ConnectionMode, ModelDescriptor, ModelRegistry},
};

type ChildSlot = Arc<Mutex<Option<Child>>>;

/// A live local endpoint for one model. Dropping the handle terminates
/// the forwarder; `release` additionally reaps it.
#[derive(Debug)]
pub struct TunnelHandle {
    model_key: String,
    base_url: String,
    endpoint_path: String,
    slot: Option<ChildSlot>,
    /// Held for the handle's lifetime: serializes acquires per key.
    _guard: Option<OwnedMutexGuard<()>>,
}

impl TunnelHandle {
    /// Handle for an endpoint reachable without a forwarder. Used for
    /// `direct` connection mode and by test doubles.
    pub fn direct(
        model_key: impl Into<String>,
        base_url: impl Into<String>,
        endpoint_path: impl Into<String>,
    ) -> Self {
        Self {
            model_key: model_key.into(),
            base_url: base_url.into(),
            endpoint_path: endpoint_path.into(),
            slot: None,
            _guard: None,
        }
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL joined with the descriptor's endpoint path.
    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.base_url, self.endpoint_path)
    }

    fn take_child(&mut self) -> Option<Child> {
        self.slot
            .as_ref()
            .and_then(|slot| slot.lock().ok().and_then(|mut guard| guard.take()))
    }

    /// Terminate the forwarder and wait for it to exit. Idempotent and
    /// infallible: a forwarder that is already gone is not an error.
    pub async fn release(mut self) {
        if let Some(mut child) = self.take_child() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(model_key = %self.model_key, "tunnel released");
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        // Last-resort teardown; kill_on_drop on the child backs this up
        // even when the slot was already shared away.
        if let Some(mut child) = self.take_child() {
            let _ = child.start_kill();
        }
    }
}

pub struct TunnelManager {
    registry: Arc<ModelRegistry>,
    settings: TunnelSettings,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Forwarder children by local port, for orphan attribution.
    port_children: DashMap<u16, ChildSlot>,
}

impl TunnelManager {
    pub fn new(registry: Arc<ModelRegistry>, settings: TunnelSettings) -> Self {
        Self {
            registry,
            settings,
            key_locks: DashMap::new(),
            port_children: DashMap::new(),
        }
    }

    fn key_lock(&self, model_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(model_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of forwarder processes currently tracked. Zero once all
    /// outstanding handles are released.
    pub fn live_forwarders(&self) -> usize {
        self.port_children
            .iter()
            .filter(|slot| slot.lock().map(|g| g.is_some()).unwrap_or(false))
            .count()
    }

    pub async fn acquire(
        &self,
        model_key: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<TunnelHandle> {
        let descriptor = self.registry.get(model_key).await?;

        if descriptor.connection_mode == ConnectionMode::Direct {
            let host = descriptor
                .direct_host
                .clone()
                .unwrap_or_else(|| descriptor.remote_host.clone());
            let port = descriptor.direct_port.unwrap_or(descriptor.remote_port);
            debug!(model_key, host, port, "direct connection, no tunnel");
            return Ok(TunnelHandle::direct(
                model_key,
                format!("http://{host}:{port}"),
                descriptor.endpoint_path.clone(),
            ));
        }

        // Serialize per key: a second acquire waits for the first
        // handle to release. Distinct keys proceed in parallel.
        let key_lock = self.key_lock(model_key);
        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            guard = key_lock.lock_owned() => guard,
        };

        let port = descriptor.local_port;
        if port_open(port).await {
            // Possibly our own orphaned forwarder; terminate what we
            // can attribute to ourselves and retry once.
            self.kill_tracked(port).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if port_open(port).await {
                return Err(PipelineError::LocalPortInUse { port });
            }
        }

        let child = spawn_forwarder(&descriptor)?;
        let slot: ChildSlot = Arc::new(Mutex::new(Some(child)));
        self.port_children.insert(port, Arc::clone(&slot));

        match self.wait_ready(model_key, port, cancel).await {
            Ok(()) => {}
            Err(err) => {
                if let Ok(mut guard) = slot.lock() {
                    if let Some(mut child) = guard.take() {
                        let _ = child.start_kill();
                    }
                }
                return Err(err);
            }
        }

        info!(
            model_key,
            port,
            remote = %format!("{}:{}", descriptor.remote_host, descriptor.remote_port),
            "tunnel ready"
        );
        Ok(TunnelHandle {
            model_key: model_key.to_string(),
            base_url: format!("http://127.0.0.1:{port}"),
            endpoint_path: descriptor.endpoint_path.clone(),
            slot: Some(slot),
            _guard: Some(guard),
        })
    }

    async fn kill_tracked(&self, port: u16) {
        let slot = self.port_children.get(&port).map(|s| Arc::clone(&s));
        let child = slot.and_then(|s| s.lock().ok().and_then(|mut guard| guard.take()));
        if let Some(mut child) = child {
            warn!(port, "terminating orphaned forwarder on contended port");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// TCP-probe the forwarded port until it accepts a connection.
    async fn wait_ready(
        &self,
        model_key: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let started = Instant::now();
        loop {
            if port_open(port).await {
                return Ok(());
            }
            if started.elapsed() >= self.settings.ready_timeout {
                return Err(PipelineError::TunnelReadinessTimeout {
                    model_key: model_key.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(self.settings.probe_interval) => {}
            }
        }
    }
}

async fn port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(2),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

fn spawn_forwarder(descriptor: &ModelDescriptor) -> PipelineResult<Child> {
    let destination = if descriptor.ssh_user.is_empty() {
        descriptor.ssh_host.clone()
    } else {
        format!("{}@{}", descriptor.ssh_user, descriptor.ssh_host)
    };
    let forward = format!(
        "{}:{}:{}",
        descriptor.local_port, descriptor.remote_host, descriptor.remote_port
    );
    debug!(model_key = %descriptor.key, forward, destination, "starting forwarder");
    Command::new("ssh")
        .arg("-N")
        .args(["-o", "ExitOnForwardFailure=yes"])
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "ConnectTimeout=10"])
        .args(["-L", &forward])
        .arg(destination)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::Network {
            context: format!("ssh forward for {}", descriptor.key),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_connector::MemoryCoordStore,
        protocols::run::SamplingParams,
        registry::ModelRegistry,
    };

    fn direct_descriptor(port: u16) -> ModelDescriptor {
        ModelDescriptor {
            key: "direct_vl".into(),
            name: "Direct".into(),
            model_id: None,
            ssh_host: String::new(),
            ssh_user: String::new(),
            local_port: 0,
            remote_host: "127.0.0.1".into(),
            remote_port: port,
            endpoint_path: "/v1/chat/completions".into(),
            supports_video: true,
            connection_mode: ConnectionMode::Direct,
            direct_host: Some("127.0.0.1".into()),
            direct_port: Some(port),
            sampling: SamplingParams::default(),
        }
    }

    async fn manager_with(descriptor: ModelDescriptor) -> TunnelManager {
        let registry = Arc::new(ModelRegistry::new(Arc::new(MemoryCoordStore::new())));
        registry.upsert(&descriptor).await.unwrap();
        TunnelManager::new(registry, TunnelSettings::default())
    }

    #[tokio::test]
    async fn direct_mode_yields_remote_url_without_forwarder() {
        let manager = manager_with(direct_descriptor(9099)).await;
        let cancel = CancellationToken::new();
        let handle = manager.acquire("direct_vl", &cancel).await.unwrap();
        assert_eq!(handle.base_url(), "http://127.0.0.1:9099");
        assert_eq!(
            handle.endpoint_url(),
            "http://127.0.0.1:9099/v1/chat/completions"
        );
        assert_eq!(manager.live_forwarders(), 0);
        handle.release().await;
    }

    #[tokio::test]
    async fn unknown_model_fails_before_spawning_anything() {
        let manager = manager_with(direct_descriptor(9099)).await;
        let cancel = CancellationToken::new();
        let err = manager.acquire("ghost", &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotRegistered { .. }));
        assert_eq!(manager.live_forwarders(), 0);
    }

    #[tokio::test]
    async fn direct_acquire_has_no_interruptible_wait() {
        let manager = manager_with(direct_descriptor(9099)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Tunnel-mode acquires observe the token at the per-key lock
        // and the readiness probe; direct mode has nothing to wait on.
        let handle = manager.acquire("direct_vl", &cancel).await;
        assert!(handle.is_ok());
    }
}
