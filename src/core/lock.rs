//! Per-subject mutual exclusion.
//!
//! One lock key per subject, held by at most one run at a time. The
//! stored value is the fencing token: refresh and release only act
//! while the token still matches, so a worker that lost its lock to TTL
//! expiry can never touch a successor's lock.
//!
//! The enqueue adapter acquires the lock with the run id as token; the
//! worker that picks the run up adopts the same token, which is how
//! ownership travels from submit to execution without extra state.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    core::{
        error::{PipelineError, PipelineResult},
        keys,
    },
    data_connector::CoordStore,
};

/// Proof of lock ownership for one subject.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub subject_id: String,
    token: String,
}

impl LockHandle {
    /// Reconstruct a handle for a lock acquired elsewhere with a known
    /// token. Ownership is only proven by a successful `refresh`.
    pub fn adopt(subject_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct LockManager {
    store: Arc<dyn CoordStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Atomic set-if-absent with the caller's token. `Conflict` when
    /// another holder exists.
    pub async fn acquire(&self, subject_id: &str, token: &str) -> PipelineResult<LockHandle> {
        let acquired = self
            .store
            .set_nx_ex(&keys::lock(subject_id), token, self.ttl)
            .await?;
        if !acquired {
            return Err(PipelineError::Conflict {
                subject_id: subject_id.to_string(),
            });
        }
        info!(subject_id, "acquired pipeline lock");
        Ok(LockHandle {
            subject_id: subject_id.to_string(),
            token: token.to_string(),
        })
    }

    /// Extend the TTL. `LockLost` when the key expired or the token no
    /// longer matches.
    pub async fn refresh(&self, handle: &LockHandle) -> PipelineResult<()> {
        let refreshed = self
            .store
            .expire_if_equals(&keys::lock(&handle.subject_id), &handle.token, self.ttl)
            .await?;
        if !refreshed {
            return Err(PipelineError::LockLost {
                subject_id: handle.subject_id.clone(),
            });
        }
        debug!(subject_id = %handle.subject_id, "refreshed pipeline lock");
        Ok(())
    }

    /// Compare-and-delete. A lock already expired or taken over is
    /// logged and otherwise ignored; release must not fail the caller.
    pub async fn release(&self, handle: &LockHandle) -> PipelineResult<()> {
        let released = self
            .store
            .del_if_equals(&keys::lock(&handle.subject_id), &handle.token)
            .await?;
        if released {
            info!(subject_id = %handle.subject_id, "released pipeline lock");
        } else {
            warn!(
                subject_id = %handle.subject_id,
                "lock already released or taken over"
            );
        }
        Ok(())
    }

    pub async fn is_held(&self, subject_id: &str) -> PipelineResult<bool> {
        Ok(self.store.exists(&keys::lock(subject_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_connector::MemoryCoordStore;

    fn manager() -> (LockManager, Arc<MemoryCoordStore>) {
        let store = Arc::new(MemoryCoordStore::new());
        (
            LockManager::new(store.clone(), Duration::from_secs(60)),
            store,
        )
    }

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let (manager, _) = manager();
        let _held = manager.acquire("vid", "run-1").await.unwrap();
        let err = manager.acquire("vid", "run-2").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn release_frees_the_subject() {
        let (manager, _) = manager();
        let handle = manager.acquire("vid", "run-1").await.unwrap();
        assert!(manager.is_held("vid").await.unwrap());
        manager.release(&handle).await.unwrap();
        assert!(!manager.is_held("vid").await.unwrap());
        assert!(manager.acquire("vid", "run-2").await.is_ok());
    }

    #[tokio::test]
    async fn adopted_handle_refreshes_with_matching_token() {
        let (manager, _) = manager();
        manager.acquire("vid", "run-1").await.unwrap();
        let adopted = LockHandle::adopt("vid", "run-1");
        assert!(manager.refresh(&adopted).await.is_ok());

        let impostor = LockHandle::adopt("vid", "run-9");
        assert!(matches!(
            manager.refresh(&impostor).await,
            Err(PipelineError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn refresh_fails_after_expiry() {
        let (manager, store) = manager();
        let handle = manager.acquire("vid", "run-1").await.unwrap();
        store.expire_now(&keys::lock("vid"));
        let err = manager.refresh(&handle).await.unwrap_err();
        assert!(matches!(err, PipelineError::LockLost { .. }));
    }

    #[tokio::test]
    async fn stale_release_does_not_touch_new_holder() {
        let (manager, store) = manager();
        let stale = manager.acquire("vid", "run-1").await.unwrap();
        store.expire_now(&keys::lock("vid"));
        let fresh = manager.acquire("vid", "run-2").await.unwrap();

        // The stale handle's release is a no-op for the fresh lock.
        manager.release(&stale).await.unwrap();
        assert!(manager.is_held("vid").await.unwrap());
        assert!(manager.refresh(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn double_release_is_harmless() {
        let (manager, _) = manager();
        let handle = manager.acquire("vid", "run-1").await.unwrap();
        manager.release(&handle).await.unwrap();
        manager.release(&handle).await.unwrap();
    }
}
