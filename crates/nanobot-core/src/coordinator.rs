// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session locks and single-flight background consolidation tasks.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

const LOCK_MAP_PURGE_THRESHOLD: usize = 100;

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Tracks in-flight consolidation tasks and per-session locks.
///
/// The maps are individually shared so spawned background tasks can clean
/// up after themselves without holding the coordinator itself.
#[derive(Default)]
pub struct ConsolidationCoordinator {
    in_progress: Arc<Mutex<HashSet<String>>>,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    locks: LockMap,
}

impl ConsolidationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return (creating on demand) the lock for a session key.
    pub fn get_lock(&self, session_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry if unused; batch-clean when the map grows large.
    pub fn prune_lock(&self, session_key: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        prune_lock_map(&self.locks, session_key, lock);
    }

    pub fn is_in_progress(&self, session_key: &str) -> bool {
        self.in_progress.lock().unwrap().contains(session_key)
    }

    /// Cancel the task registered for `key` (if any) and await its
    /// termination, swallowing cancellation.
    pub async fn cancel_inflight(&self, session_key: &str) {
        let handle = self.tasks.lock().unwrap().remove(session_key);
        if let Some(handle) = handle {
            if !handle.is_finished() {
                handle.abort();
                let _ = handle.await;
            }
        }
        self.in_progress.lock().unwrap().remove(session_key);
    }

    /// Run `work` under the per-session lock while marking the session as
    /// consolidating.
    pub async fn run_exclusive<T>(&self, session_key: &str, work: impl Future<Output = T>) -> T {
        let lock = self.get_lock(session_key);
        self.in_progress.lock().unwrap().insert(session_key.to_string());
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        self.in_progress.lock().unwrap().remove(session_key);
        self.prune_lock(session_key, &lock);
        result
    }

    /// Spawn background work for `key` unless one is already in progress.
    /// Returns an abort handle for the spawned task, or None when skipped.
    pub fn start_background(
        &self,
        session_key: &str,
        work: impl Future<Output = ()> + Send + 'static,
    ) -> Option<tokio::task::AbortHandle> {
        {
            let mut in_progress = self.in_progress.lock().unwrap();
            if in_progress.contains(session_key) {
                return None;
            }
            in_progress.insert(session_key.to_string());
        }

        let lock = self.get_lock(session_key);
        let in_progress = Arc::clone(&self.in_progress);
        let tasks = Arc::clone(&self.tasks);
        let locks = Arc::clone(&self.locks);
        let key = session_key.to_string();
        let handle = tokio::spawn(async move {
            {
                let _guard = lock.lock().await;
                work.await;
            }
            in_progress.lock().unwrap().remove(&key);
            prune_lock_map(&locks, &key, &lock);
            tasks.lock().unwrap().remove(&key);
        });
        let abort = handle.abort_handle();
        self.tasks
            .lock()
            .unwrap()
            .insert(session_key.to_string(), handle);
        Some(abort)
    }
}

fn prune_lock_map(locks: &Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>, session_key: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
    let mut locks = locks.lock().unwrap();
    if lock.try_lock().is_ok() {
        locks.remove(session_key);
    }
    if locks.len() > LOCK_MAP_PURGE_THRESHOLD {
        locks.retain(|_, l| l.try_lock().is_err());
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn run_exclusive_serializes_same_key() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run_exclusive("k", async move {
                        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "no concurrent holders");
    }

    #[tokio::test]
    async fn start_background_is_single_flight_per_key() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let slow = {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        };
        coordinator.start_background("k", slow);
        assert!(coordinator.is_in_progress("k"));

        // Second request while the first is running is dropped.
        let runs2 = runs.clone();
        coordinator.start_background("k", async move {
            runs2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_progress("k"), "cleared after completion");
    }

    #[tokio::test]
    async fn cancel_inflight_aborts_running_task() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let finished2 = finished.clone();
        coordinator.start_background("k", async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            finished2.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        coordinator.cancel_inflight("k").await;
        assert_eq!(finished.load(Ordering::SeqCst), 0, "task was aborted");
        assert!(!coordinator.is_in_progress("k"));
    }

    #[tokio::test]
    async fn prune_lock_drops_unused_entries() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        let lock = coordinator.get_lock("a");
        assert_eq!(coordinator.locks.lock().unwrap().len(), 1);
        coordinator.prune_lock("a", &lock);
        assert_eq!(coordinator.locks.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn prune_keeps_locked_entries() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        let lock = coordinator.get_lock("a");
        let guard = lock.lock().await;
        coordinator.prune_lock("a", &lock);
        assert_eq!(coordinator.locks.lock().unwrap().len(), 1, "held lock kept");
        drop(guard);
    }

    #[tokio::test]
    async fn lock_map_batch_purges_past_threshold() {
        let coordinator = Arc::new(ConsolidationCoordinator::new());
        for i in 0..=LOCK_MAP_PURGE_THRESHOLD {
            coordinator.get_lock(&format!("k{i}"));
        }
        let extra = coordinator.get_lock("extra");
        let _guard = extra.lock().await;
        coordinator.prune_lock("never-present", &coordinator.get_lock("tmp"));
        let remaining = coordinator.locks.lock().unwrap().len();
        assert!(remaining <= 2, "unlocked entries purged, got {remaining}");
    }
}
