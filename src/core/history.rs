//! Run archival: `pipeline:run:{run_id}` snapshots plus the per-subject
//! history sorted-set.
//!
//! Archiving is the single terminal bookkeeping step of a run: copy the
//! active hash to the run key with TTL, index it by completion time,
//! trim the index, then delete the active hash.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    core::{error::PipelineResult, keys, status::StatusSnapshot},
    data_connector::CoordStore,
};

pub struct HistoryArchive {
    store: Arc<dyn CoordStore>,
    ttl: Duration,
    max_runs: usize,
}

impl HistoryArchive {
    pub fn new(store: Arc<dyn CoordStore>, ttl: Duration, max_runs: usize) -> Self {
        Self {
            store,
            ttl,
            max_runs,
        }
    }

    /// Move the subject's active hash into history. Returns the
    /// archived run id, or `None` when no active run exists.
    pub async fn archive(&self, subject_id: &str) -> PipelineResult<Option<String>> {
        let active_key = keys::active(subject_id);
        let fields = self.store.hash_get_all(&active_key).await?;
        if fields.is_empty() {
            warn!(subject_id, "no active run to archive");
            return Ok(None);
        }
        let Some(run_id) = fields.get("run_id").filter(|v| !v.is_empty()).cloned() else {
            warn!(subject_id, "active run has no run_id; dropping");
            self.store.del(&active_key).await?;
            return Ok(None);
        };

        let score = fields
            .get("completed_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis()) as f64;

        let run_key = keys::run(&run_id);
        let flat: Vec<(String, String)> = fields.into_iter().collect();
        self.store.hash_set(&run_key, &flat).await?;
        self.store.expire(&run_key, self.ttl).await?;
        self.store
            .zadd(&keys::history(subject_id), &run_id, score)
            .await?;
        self.trim(subject_id).await?;
        self.store.del(&active_key).await?;

        info!(subject_id, run_id, "archived run to history");
        Ok(Some(run_id))
    }

    /// Keep the newest `max_runs` entries; drop older index members and
    /// their snapshots.
    async fn trim(&self, subject_id: &str) -> PipelineResult<()> {
        let history_key = keys::history(subject_id);
        let total = self.store.zcard(&history_key).await?;
        if total <= self.max_runs {
            return Ok(());
        }
        let excess = (total - self.max_runs) as isize;
        let oldest = self.store.zrange(&history_key, 0, excess - 1).await?;
        for run_id in oldest {
            self.store.zrem(&history_key, &run_id).await?;
            self.store.del(&keys::run(&run_id)).await?;
            info!(subject_id, run_id, "trimmed old run from history");
        }
        Ok(())
    }

    pub async fn run(&self, run_id: &str) -> PipelineResult<Option<StatusSnapshot>> {
        let fields = self.store.hash_get_all(&keys::run(run_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(StatusSnapshot::from_fields(fields))
    }

    pub async fn latest(&self, subject_id: &str) -> PipelineResult<Option<StatusSnapshot>> {
        let ids = self.store.zrevrange(&keys::history(subject_id), 0, 0).await?;
        match ids.first() {
            Some(run_id) => self.run(run_id).await,
            None => Ok(None),
        }
    }

    /// Newest-first history snapshots. Snapshots whose run hash already
    /// expired are skipped.
    pub async fn list(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> PipelineResult<Vec<StatusSnapshot>> {
        let stop = if limit == 0 { -1 } else { limit as isize - 1 };
        let ids = self
            .store
            .zrevrange(&keys::history(subject_id), 0, stop)
            .await?;
        let mut runs = Vec::with_capacity(ids.len());
        for run_id in ids {
            if let Some(snapshot) = self.run(&run_id).await? {
                runs.push(snapshot);
            }
        }
        Ok(runs)
    }

    /// Raw field map of an archived run; used by tests to assert fields
    /// the typed snapshot does not surface.
    pub async fn run_fields(&self, run_id: &str) -> PipelineResult<HashMap<String, String>> {
        Ok(self.store.hash_get_all(&keys::run(run_id)).await?)
    }
}
