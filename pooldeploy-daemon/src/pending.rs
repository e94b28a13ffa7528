//! Coalescing change buffer and the fixed-interval flush loop that drains it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pooldeploy_core::ChangeRecord;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Latest change per path since the last flush.
///
/// Many writers insert concurrently; exactly one flush drains it at a time by
/// swapping the map out under the lock.
#[derive(Debug, Default)]
pub struct PendingChangeSet {
    inner: Mutex<HashMap<PathBuf, ChangeRecord>>,
}

impl PendingChangeSet {
    /// Insert or overwrite. The newest event for a path wins outright; earlier
    /// kinds are not merged into it.
    pub fn insert(&self, record: ChangeRecord) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(record.path.clone(), record);
    }

    /// Take everything collected so far, leaving the set empty.
    pub fn drain(&self) -> Vec<ChangeRecord> {
        let taken = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *map)
        };
        let mut batch: Vec<ChangeRecord> = taken.into_values().collect();
        batch.sort_by(|a, b| a.path.cmp(&b.path));
        batch
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drains a [`PendingChangeSet`] every `interval`, regardless of how events
/// arrive.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    pending: Arc<PendingChangeSet>,
    interval: Duration,
}

impl FlushScheduler {
    pub fn new(pending: Arc<PendingChangeSet>, interval: Duration) -> Self {
        Self { pending, interval }
    }

    /// Drain once, outside the timer. Used for the final flush on shutdown.
    pub fn flush(&self) -> Vec<ChangeRecord> {
        self.pending.drain()
    }

    /// Tick until `shutdown` fires, handing every non-empty batch to
    /// `on_batch`.
    ///
    /// `on_batch` is awaited inside the loop, so a slow batch delays the next
    /// tick instead of overlapping with it. The remainder left at shutdown is
    /// not flushed here; the caller does that once intake has stopped.
    pub async fn run<F, Fut>(&self, mut on_batch: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: FnMut(Vec<ChangeRecord>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let batch = self.flush();
                    if batch.is_empty() {
                        continue;
                    }
                    tracing::debug!(changes = batch.len(), "flushing pending changes");
                    on_batch(batch).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pooldeploy_core::ChangeKind;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    #[test]
    fn last_event_for_a_path_wins() {
        let pending = PendingChangeSet::default();
        pending.insert(ChangeRecord::new("/src/a.txt", ChangeKind::Created));
        pending.insert(ChangeRecord::new("/src/a.txt", ChangeKind::Modified));
        pending.insert(ChangeRecord::new("/src/a.txt", ChangeKind::Modified));
        pending.insert(ChangeRecord::new("/src/b.txt", ChangeKind::Deleted));

        let batch = pending.drain();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, PathBuf::from("/src/a.txt"));
        assert_eq!(batch[0].kind, ChangeKind::Modified);
        assert!(pending.is_empty(), "drain must leave the set empty");
    }

    #[test]
    fn created_then_deleted_reports_deleted() {
        let pending = PendingChangeSet::default();
        pending.insert(ChangeRecord::new("/src/a.txt", ChangeKind::Created));
        pending.insert(ChangeRecord::new("/src/a.txt", ChangeKind::Deleted));
        let batch = pending.drain();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, ChangeKind::Deleted);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn scheduler_emits_on_fixed_interval_and_skips_empty_batches() {
        let pending = Arc::new(PendingChangeSet::default());
        let scheduler = FlushScheduler::new(pending.clone(), Duration::from_millis(5_000));
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<Vec<ChangeRecord>>();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run(
                        |batch| {
                            let batch_tx = batch_tx.clone();
                            async move {
                                let _ = batch_tx.send(batch);
                            }
                        },
                        shutdown_rx,
                    )
                    .await;
            })
        };

        // Three touches inside one interval.
        for kind in [ChangeKind::Created, ChangeKind::Modified, ChangeKind::Modified] {
            pending.insert(ChangeRecord::new("/src/app1/a.txt", kind));
            advance(Duration::from_millis(600)).await;
        }
        assert!(batch_rx.try_recv().is_err(), "nothing before the first tick");

        advance(Duration::from_millis(5_000)).await;
        tokio::task::yield_now().await;
        let batch = batch_rx.recv().await.expect("batch after tick");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, ChangeKind::Modified);

        // Idle interval: the empty batch is never handed out.
        advance(Duration::from_millis(5_000)).await;
        tokio::task::yield_now().await;
        assert!(batch_rx.try_recv().is_err());

        pending.insert(ChangeRecord::new("/src/app1/b.txt", ChangeKind::Created));
        let _ = shutdown_tx.send(());
        task.await.expect("scheduler task");
        // The remainder is left for the caller's final flush.
        assert_eq!(scheduler.flush().len(), 1);
    }
}
