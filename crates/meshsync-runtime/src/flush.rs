//! Debounced persistence
//!
//! Store mutations only mark records dirty. The flusher coalesces them and
//! writes once the throttle window after the first unflushed mutation has
//! passed. Write failures are logged and the affected keys are retried on
//! the next flush; in-memory state stays authoritative.

use std::sync::Arc;
use std::time::Duration;

use meshsync_core::{MeshContext, Persistence};
use tokio::time::Instant;
use tracing::{debug, error};

/// Flush counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: u64,
    pub records_written: u64,
    pub records_deleted: u64,
    pub failures: u64,
}

/// Throttled writer from a [`MeshContext`] to a [`Persistence`] backend
pub struct Flusher {
    store: Arc<dyn Persistence>,
    throttle: Duration,
    deadline: Option<Instant>,
    stats: FlushStats,
}

impl Flusher {
    pub fn new(store: Arc<dyn Persistence>, throttle: Duration) -> Self {
        Self {
            store,
            throttle,
            deadline: None,
            stats: FlushStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Arm the flush timer if it is not already running
    ///
    /// Later mutations inside the window join the pending flush instead of
    /// pushing it back.
    pub fn schedule(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.throttle);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleep until the armed deadline; pends forever when nothing is armed
    pub async fn wait_due(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Write every dirty record now
    pub async fn flush(&mut self, ctx: &mut MeshContext) {
        self.deadline = None;
        let keys = ctx.take_dirty();
        if keys.is_empty() {
            return;
        }
        self.stats.flushes += 1;
        debug!("Flushing {} record(s)", keys.len());

        let mut retry = Vec::new();
        for key in keys {
            let value = match ctx.record_value(&key) {
                Ok(value) => value,
                Err(err) => {
                    error!("Cannot encode {}/{}: {}", key.collection.as_str(), key.key, err);
                    self.stats.failures += 1;
                    continue;
                }
            };
            let outcome = match value {
                Some(value) => self
                    .store
                    .put(key.collection, &key.key, value)
                    .await
                    .map(|()| self.stats.records_written += 1),
                None => self
                    .store
                    .delete(key.collection, &key.key)
                    .await
                    .map(|()| self.stats.records_deleted += 1),
            };
            if let Err(err) = outcome {
                error!("Persisting {}/{} failed: {}", key.collection.as_str(), key.key, err);
                self.stats.failures += 1;
                retry.push(key);
            }
        }

        if !retry.is_empty() {
            ctx.restore_dirty(retry);
            self.schedule();
        }
    }

    pub fn get_statistics(&self) -> FlushStats {
        self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{
        storage::Collection, types::Timestamp, MemoryPersistence, MeshConfig, MeshDeviceId,
    };

    fn create_test_flusher() -> (Flusher, Arc<MemoryPersistence>) {
        let store = Arc::new(MemoryPersistence::new());
        (Flusher::new(store.clone(), Duration::from_millis(3000)), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_debounced() {
        let (mut flusher, _) = create_test_flusher();
        flusher.schedule();
        let first = flusher.deadline();
        tokio::time::advance(Duration::from_millis(1000)).await;
        flusher.schedule();
        assert_eq!(flusher.deadline(), first);
        assert!(!flusher.is_due());

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(flusher.is_due());
    }

    #[tokio::test]
    async fn test_flush_writes_and_deletes() {
        let (mut flusher, store) = create_test_flusher();
        let mut ctx = MeshContext::new(MeshConfig::testing());
        let slot = MeshDeviceId::new(3);
        ctx.bind_slot(slot, Timestamp::new(10));

        flusher.flush(&mut ctx).await;
        assert_eq!(store.len(Collection::Devices).await, 1);
        assert_eq!(store.len(Collection::NodeDatabases).await, 1);
        assert!(!ctx.has_pending_writes());

        ctx.remove_device(slot);
        flusher.flush(&mut ctx).await;
        assert_eq!(store.len(Collection::Devices).await, 0);
        assert_eq!(flusher.get_statistics().records_deleted, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_keys_dirty() {
        let (mut flusher, store) = create_test_flusher();
        let mut ctx = MeshContext::new(MeshConfig::testing());
        ctx.bind_slot(MeshDeviceId::new(4), Timestamp::new(10));

        store.set_fail_writes(true);
        flusher.flush(&mut ctx).await;
        assert!(ctx.has_pending_writes());
        assert!(flusher.deadline().is_some());
        assert!(flusher.get_statistics().failures > 0);

        store.set_fail_writes(false);
        flusher.flush(&mut ctx).await;
        assert!(!ctx.has_pending_writes());
        assert_eq!(store.len(Collection::Messages).await, 1);
    }
}
