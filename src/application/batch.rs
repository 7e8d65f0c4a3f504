use crate::domain::batch::{BatchStatus, ImportBatch, ItemOutcome};
use crate::domain::matching::Disposition;
use crate::domain::payment::DateRange;
use crate::domain::ports::BatchStoreArc;
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared, owning reference to a running batch.
///
/// Workers of the same run record outcomes through clones of the handle; every
/// mutation is persisted before the lock is released.
#[derive(Clone)]
pub struct BatchHandle {
    batch_id: Uuid,
    inner: Arc<Mutex<ImportBatch>>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub async fn snapshot(&self) -> ImportBatch {
        self.inner.lock().await.clone()
    }
}

/// Records the lifecycle and counters of ingestion runs.
#[derive(Clone)]
pub struct BatchTracker {
    store: BatchStoreArc,
}

impl BatchTracker {
    pub fn new(store: BatchStoreArc) -> Self {
        Self { store }
    }

    pub async fn start(&self, range: DateRange, source: &str) -> Result<BatchHandle> {
        let batch = ImportBatch::start(source, range);
        self.store.save(batch.clone()).await?;
        info!(batch_id = %batch.batch_id, source, "Import batch started");
        Ok(BatchHandle {
            batch_id: batch.batch_id,
            inner: Arc::new(Mutex::new(batch)),
        })
    }

    /// Re-attaches to a persisted batch, e.g. to retry finalization.
    pub async fn resume(&self, batch_id: Uuid) -> Result<Option<BatchHandle>> {
        Ok(self.store.get(batch_id).await?.map(|batch| BatchHandle {
            batch_id,
            inner: Arc::new(Mutex::new(batch)),
        }))
    }

    pub async fn record_outcome(&self, handle: &BatchHandle, outcome: ItemOutcome) -> Result<()> {
        let mut batch = handle.inner.lock().await;
        if batch.is_terminal() {
            warn!(batch_id = %batch.batch_id, ?outcome, "Outcome recorded after batch closed, ignoring");
            return Ok(());
        }
        batch.counters.record(outcome);
        debug!(batch_id = %batch.batch_id, ?outcome, total = batch.counters.total, "Recorded item outcome");
        self.store.save(batch.clone()).await
    }

    pub async fn record_disposition(
        &self,
        handle: &BatchHandle,
        disposition: Disposition,
    ) -> Result<()> {
        let mut batch = handle.inner.lock().await;
        if batch.is_terminal() {
            return Ok(());
        }
        match disposition {
            Disposition::AutoMatch => batch.dispositions.auto_matched += 1,
            Disposition::Ambiguous => batch.dispositions.ambiguous += 1,
            Disposition::Unmatched => batch.dispositions.unmatched += 1,
        }
        self.store.save(batch.clone()).await
    }

    /// Closes the batch as completed. A second call is a no-op.
    pub async fn complete(&self, handle: &BatchHandle) -> Result<ImportBatch> {
        self.close(handle, BatchStatus::Completed, None).await
    }

    /// Closes the batch as failed. A second call is a no-op.
    pub async fn fail(&self, handle: &BatchHandle, error: &str) -> Result<ImportBatch> {
        self.close(handle, BatchStatus::Failed, Some(error.to_string()))
            .await
    }

    async fn close(
        &self,
        handle: &BatchHandle,
        status: BatchStatus,
        error: Option<String>,
    ) -> Result<ImportBatch> {
        let mut batch = handle.inner.lock().await;
        // The shared batch only turns terminal once the store has it, so a
        // failed save can be retried.
        let mut closed = batch.clone();
        if closed.close(status, error) {
            self.store.save(closed.clone()).await?;
            *batch = closed;
            let c = batch.counters;
            info!(
                batch_id = %batch.batch_id,
                status = batch.status.as_str(),
                total = c.total,
                imported = c.imported,
                skipped = c.skipped,
                failed = c.failed,
                "Import batch finished"
            );
        } else {
            debug!(batch_id = %batch.batch_id, "Batch already closed");
        }
        Ok(batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BatchStore;
    use crate::error::ReconcileError;
    use crate::infrastructure::in_memory::InMemoryBatchStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_outcomes_are_persisted_and_balanced() {
        let store = Arc::new(InMemoryBatchStore::new());
        let tracker = BatchTracker::new(store.clone());
        let handle = tracker.start(DateRange::unbounded(), "csv").await.unwrap();

        tracker.record_outcome(&handle, ItemOutcome::Imported).await.unwrap();
        tracker.record_outcome(&handle, ItemOutcome::Skipped).await.unwrap();
        tracker.record_outcome(&handle, ItemOutcome::Failed).await.unwrap();
        let batch = tracker.complete(&handle).await.unwrap();

        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.counters.is_balanced());
        let stored = store.get(handle.batch_id()).await.unwrap().unwrap();
        assert_eq!(stored.counters.total, 3);
        assert_eq!(stored.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_finalization_is_idempotent() {
        let tracker = BatchTracker::new(Arc::new(InMemoryBatchStore::new()));
        let handle = tracker.start(DateRange::unbounded(), "csv").await.unwrap();

        let first = tracker.fail(&handle, "adapter down").await.unwrap();
        let second = tracker.complete(&handle).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(second.status, BatchStatus::Failed);
        assert_eq!(second.finished_at, first.finished_at);

        tracker.record_outcome(&handle, ItemOutcome::Imported).await.unwrap();
        assert_eq!(handle.snapshot().await.counters.total, 0);
    }

    #[tokio::test]
    async fn test_resume_finalizes_persisted_batch_once() {
        let store = Arc::new(InMemoryBatchStore::new());
        let tracker = BatchTracker::new(store.clone());
        let handle = tracker.start(DateRange::unbounded(), "csv").await.unwrap();
        tracker.complete(&handle).await.unwrap();

        let resumed = tracker.resume(handle.batch_id()).await.unwrap().unwrap();
        let batch = tracker.fail(&resumed, "retry").await.unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.error.is_none());
    }

    /// Batch store that refuses saves of terminal batches until told otherwise.
    #[derive(Default)]
    struct StickyBatchStore {
        inner: InMemoryBatchStore,
        refuse_terminal: AtomicBool,
    }

    #[async_trait]
    impl BatchStore for StickyBatchStore {
        async fn save(&self, batch: ImportBatch) -> Result<()> {
            if batch.is_terminal() && self.refuse_terminal.load(Ordering::SeqCst) {
                return Err(ReconcileError::StoreUnavailable("batch table locked".into()));
            }
            self.inner.save(batch).await
        }

        async fn get(&self, batch_id: Uuid) -> Result<Option<ImportBatch>> {
            self.inner.get(batch_id).await
        }

        async fn get_all(&self) -> Result<Vec<ImportBatch>> {
            self.inner.get_all().await
        }
    }

    #[tokio::test]
    async fn test_complete_after_failed_save_persists_status() {
        let store = Arc::new(StickyBatchStore::default());
        let tracker = BatchTracker::new(store.clone());
        let handle = tracker.start(DateRange::unbounded(), "csv").await.unwrap();
        tracker.record_outcome(&handle, ItemOutcome::Imported).await.unwrap();

        store.refuse_terminal.store(true, Ordering::SeqCst);
        assert!(tracker.complete(&handle).await.is_err());
        assert_eq!(handle.snapshot().await.status, BatchStatus::Running);

        store.refuse_terminal.store(false, Ordering::SeqCst);
        let batch = tracker.complete(&handle).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        let stored = store.get(handle.batch_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.counters.imported, 1);
    }
}
