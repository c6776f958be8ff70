//! Worker Registry
//!
//! Tracks capability-tagged workers and their current load, and performs
//! greedy least-loaded selection for step dispatch.
//!
//! Load accounting is paired by construction: selection hands out a
//! [`WorkerLease`] that increments the worker's load and decrements it
//! again when dropped, so every exit path (success, failure, timeout)
//! releases the slot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, info};

/// Load level above which a worker counts as a bottleneck.
pub const BOTTLENECK_LOAD: usize = 3;

/// A registered worker: a capability set plus a concurrency limit.
#[derive(Debug)]
struct Worker {
    capabilities: HashSet<String>,
    max_concurrent: usize,
    load: Arc<AtomicUsize>,
}

/// Read-only view of one worker, as returned by [`WorkerRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: HashSet<String>,
    pub max_concurrent: usize,
    pub current_load: usize,
}

impl WorkerInfo {
    /// True when this worker offers every required capability and has a
    /// free slot.
    pub fn is_eligible(&self, required: &[&str]) -> bool {
        self.current_load < self.max_concurrent
            && required.iter().all(|cap| self.capabilities.contains(*cap))
    }

    /// True when this worker's load exceeds the bottleneck threshold.
    pub fn is_bottleneck(&self) -> bool {
        self.current_load > BOTTLENECK_LOAD
    }
}

/// Picks a worker from a snapshot: honor `preferred` when that worker is
/// eligible, otherwise take the eligible worker with the lowest current
/// load (first match on ties).
///
/// Shared between live selection and the adaptive controller's
/// prospective-assignment checks so both agree on routing.
pub fn pick_worker<'a>(
    workers: &'a [WorkerInfo],
    required: &[&str],
    preferred: Option<&str>,
) -> Option<&'a WorkerInfo> {
    if let Some(id) = preferred {
        if let Some(w) = workers.iter().find(|w| w.id == id) {
            if w.is_eligible(required) {
                return Some(w);
            }
        }
    }

    workers
        .iter()
        .filter(|w| w.is_eligible(required))
        .min_by_key(|w| w.current_load)
}

/// An acquired dispatch slot on a worker.
///
/// Holds the load increment for the duration of one dispatch attempt and
/// releases it on drop.
#[derive(Debug)]
pub struct WorkerLease {
    worker_id: String,
    load: Arc<AtomicUsize>,
}

impl WorkerLease {
    /// ID of the leased worker.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let prev = self.load.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "worker '{}' released a slot (load {} -> {})",
            self.worker_id,
            prev,
            prev.saturating_sub(1)
        );
    }
}

/// Registry of capability-tagged workers.
///
/// There is no queueing or backoff: when no eligible worker exists,
/// selection returns `None` and the dispatch attempt fails immediately.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a worker with its capability set and
    /// maximum concurrent task count.
    pub fn register(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        max_concurrent: usize,
    ) {
        let id = id.into();
        let capabilities: HashSet<String> = capabilities.into_iter().map(Into::into).collect();
        info!(
            "registering worker '{}' with {} capabilities, max {} concurrent",
            id,
            capabilities.len(),
            max_concurrent
        );

        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        workers.insert(
            id,
            Worker {
                capabilities,
                max_concurrent: max_concurrent.max(1),
                load: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Read-only snapshot of all workers and their current loads.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<WorkerInfo> = workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: id.clone(),
                capabilities: w.capabilities.clone(),
                max_concurrent: w.max_concurrent,
                current_load: w.load.load(Ordering::SeqCst),
            })
            .collect();
        // Deterministic order keeps tie-breaking stable across calls.
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Current load per worker id.
    pub fn loads(&self) -> HashMap<String, usize> {
        self.snapshot()
            .into_iter()
            .map(|w| (w.id, w.current_load))
            .collect()
    }

    /// Sum of current load across all workers.
    pub fn total_load(&self) -> usize {
        self.snapshot().iter().map(|w| w.current_load).sum()
    }

    /// Selects a worker for the given required capabilities and acquires
    /// a dispatch slot on it.
    ///
    /// `preferred` is the step's current routed assignment; it wins when
    /// still eligible. Returns `None` when no worker qualifies.
    pub fn select(&self, required: &[&str], preferred: Option<&str>) -> Option<WorkerLease> {
        let snapshot = self.snapshot();
        let chosen = pick_worker(&snapshot, required, preferred)?;

        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let worker = workers.get(&chosen.id)?;
        let prev = worker.load.fetch_add(1, Ordering::SeqCst);
        debug!(
            "worker '{}' acquired a slot (load {} -> {})",
            chosen.id,
            prev,
            prev + 1
        );

        Some(WorkerLease {
            worker_id: chosen.id.clone(),
            load: Arc::clone(&worker.load),
        })
    }
}
