//! Stream dispatcher: consumer-group reads, idle reclamation, and
//! acknowledgement over the `pipeline:requests` stream.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    core::error::{PipelineResult, StoreResult},
    data_connector::{CoordStore, StreamEntry},
    protocols::run::RunRequest,
};

/// One delivered stream entry. Decoding is deferred so a malformed
/// payload can still be acknowledged by its id.
#[derive(Debug)]
pub struct Delivery {
    pub stream_id: String,
    pub request: PipelineResult<RunRequest>,
}

impl Delivery {
    fn from_entry(entry: StreamEntry) -> Self {
        let request = RunRequest::from_fields(&entry.fields);
        Self {
            stream_id: entry.id,
            request,
        }
    }
}

pub struct StreamDispatcher {
    store: Arc<dyn CoordStore>,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamDispatcher {
    pub fn new(
        store: Arc<dyn CoordStore>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Idempotently create the consumer group at the stream tail.
    pub async fn ensure_group(&self) -> StoreResult<()> {
        self.store.group_create(&self.stream, &self.group).await?;
        info!(stream = %self.stream, group = %self.group, "consumer group ready");
        Ok(())
    }

    /// Blocking multi-read of new entries for this consumer.
    pub async fn read(&self, count: usize, block: Duration) -> StoreResult<Vec<Delivery>> {
        let entries = self
            .store
            .group_read(&self.stream, &self.group, &self.consumer, count, block)
            .await?;
        Ok(entries.into_iter().map(Delivery::from_entry).collect())
    }

    /// Claim entries another consumer left pending longer than
    /// `min_idle` — the crashed-worker path.
    pub async fn reclaim_idle(
        &self,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<Delivery>> {
        let entries = self
            .store
            .autoclaim(&self.stream, &self.group, &self.consumer, min_idle, count)
            .await?;
        if !entries.is_empty() {
            warn!(
                claimed = entries.len(),
                consumer = %self.consumer,
                "reclaimed stale stream entries"
            );
        }
        Ok(entries.into_iter().map(Delivery::from_entry).collect())
    }

    /// Remove an entry from the pending list. Called only once the run
    /// reached a terminal state and was archived.
    pub async fn ack(&self, stream_id: &str) -> StoreResult<()> {
        let acked = self.store.ack(&self.stream, &self.group, stream_id).await?;
        if acked == 0 {
            warn!(stream_id, "ack for entry not in pending list");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data_connector::MemoryCoordStore, protocols::run::RunConfig};

    fn dispatcher(store: Arc<MemoryCoordStore>) -> StreamDispatcher {
        StreamDispatcher::new(store, "pipeline:requests", "pipeline_workers", "worker-test-1")
    }

    async fn enqueue(store: &MemoryCoordStore, subject: &str) -> RunRequest {
        let request = RunRequest::new(subject, RunConfig::new("vl", "vl"));
        store
            .stream_add("pipeline:requests", &request.to_fields().unwrap())
            .await
            .unwrap();
        request
    }

    #[tokio::test]
    async fn read_decodes_submitted_requests() {
        let store = Arc::new(MemoryCoordStore::new());
        let dispatcher = dispatcher(store.clone());
        dispatcher.ensure_group().await.unwrap();
        let submitted = enqueue(&store, "vid-1").await;

        let deliveries = dispatcher
            .read(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        let request = deliveries[0].request.as_ref().unwrap();
        assert_eq!(request.run_id, submitted.run_id);
        assert_eq!(request.subject_id, "vid-1");
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let store = Arc::new(MemoryCoordStore::new());
        let dispatcher = dispatcher(store);
        dispatcher.ensure_group().await.unwrap();
        dispatcher.ensure_group().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_entry_still_carries_its_id() {
        let store = Arc::new(MemoryCoordStore::new());
        let dispatcher = dispatcher(store.clone());
        dispatcher.ensure_group().await.unwrap();
        store
            .stream_add(
                "pipeline:requests",
                &[("garbage".to_string(), "x".to_string())],
            )
            .await
            .unwrap();

        let deliveries = dispatcher
            .read(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].request.is_err());
        dispatcher.ack(&deliveries[0].stream_id).await.unwrap();
    }

    #[tokio::test]
    async fn unacked_entry_is_reclaimable_by_another_consumer() {
        let store = Arc::new(MemoryCoordStore::new());
        let crashed = dispatcher(store.clone());
        crashed.ensure_group().await.unwrap();
        enqueue(&store, "vid-1").await;

        // Worker 1 reads but never acks (simulated crash).
        let read = crashed.read(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(read.len(), 1);

        let survivor = StreamDispatcher::new(
            store,
            "pipeline:requests",
            "pipeline_workers",
            "worker-test-2",
        );
        let reclaimed = survivor.reclaim_idle(Duration::ZERO, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].stream_id, read[0].stream_id);

        // Once acked the entry cannot be claimed again.
        survivor.ack(&reclaimed[0].stream_id).await.unwrap();
        let again = survivor.reclaim_idle(Duration::ZERO, 10).await.unwrap();
        assert!(again.is_empty());
    }
}
