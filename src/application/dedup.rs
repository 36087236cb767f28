use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::entities::ReviewMode;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How long a duplicate caller may wait on the original before giving up.
pub const DUPLICATE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

struct DedupEntry {
    created_at: Instant,
    status: EntryStatus,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// In-process fast gate collapsing identical concurrent review requests.
/// The broker's task-id uniqueness is the durable cross-process authority;
/// this map short-circuits bursts before a task is ever built.
pub struct Deduplicator {
    entries: Mutex<HashMap<String, DedupEntry>>,
    ttl: Duration,
}

/// Signals completion of the original request a duplicate collapsed into.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    rx: watch::Receiver<bool>,
}

impl WaitHandle {
    /// Waits up to `timeout` for the original request to finish.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        if *self.rx.borrow() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, self.rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DedupStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Dedup key for the in-process gate; unlike the broker task id it includes
/// the mode, so `@magpie hunt` and `@magpie security` on the same commit can
/// run side by side.
pub fn request_key(owner: &str, repo: &str, pr_number: u64, sha: &str, mode: ReviewMode) -> String {
    format!("review:{owner}/{repo}/{pr_number}:{sha}:{}", mode.as_str())
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
        }
    }

    /// Marks `key` as in flight. Returns `(true, Some(handle))` when an
    /// unexpired entry already exists; the handle signals completion of the
    /// original request.
    pub fn check_and_mark(&self, key: &str) -> (bool, Option<WaitHandle>) {
        let mut entries = self.entries.lock().expect("dedup state poisoned");

        if let Some(entry) = entries.get(key) {
            if entry.created_at.elapsed() <= self.ttl {
                info!(key, age_ms = entry.created_at.elapsed().as_millis() as u64, "duplicate request detected");
                return (
                    true,
                    Some(WaitHandle {
                        rx: entry.done_rx.clone(),
                    }),
                );
            }
            entries.remove(key);
        }

        let (done_tx, done_rx) = watch::channel(false);
        entries.insert(
            key.to_string(),
            DedupEntry {
                created_at: Instant::now(),
                status: EntryStatus::Pending,
                done_tx,
                done_rx,
            },
        );
        debug!(key, "request marked for deduplication");
        (false, None)
    }

    pub fn complete(&self, key: &str) {
        self.finish(key, EntryStatus::Completed);
    }

    pub fn fail(&self, key: &str) {
        self.finish(key, EntryStatus::Failed);
    }

    fn finish(&self, key: &str, status: EntryStatus) {
        let mut entries = self.entries.lock().expect("dedup state poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.status = status;
            let _ = entry.done_tx.send(true);
        }
    }

    /// Removes expired entries; returns how many were purged.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("dedup state poisoned");
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, e| e.created_at.elapsed() <= ttl);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "swept expired dedup entries");
        }
        purged
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                dedup.sweep();
            }
        })
    }

    pub fn stats(&self) -> DedupStats {
        let entries = self.entries.lock().expect("dedup state poisoned");
        let mut stats = DedupStats {
            total: entries.len(),
            pending: 0,
            completed: 0,
            failed: 0,
        };
        for entry in entries.values() {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Completed => stats.completed += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
