use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime counters for the crawler process.
///
/// Purpose:
/// - Track worker process churn (spawns, kills, spawn failures)
/// - Track IPC health (undecodable frames)
/// - Track result-store writes
///
/// Task-level bookkeeping (completed / failed / retried) lives in
/// the orchestrator's `Stats`; these counters describe the process
/// machinery underneath it.
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe to bump from any task, including launcher I/O tasks
#[derive(Default)]
pub struct RuntimeMetrics {
    pub workers_spawned: AtomicUsize,
    pub workers_killed: AtomicUsize,
    pub spawn_errors: AtomicUsize,

    pub ipc_decode_errors: AtomicUsize,

    pub results_persisted: AtomicUsize,
    pub persist_errors: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Single-line rendering used by the periodic resource log.
    pub fn summary(&self) -> String {
        format!(
            "spawned={} killed={} spawn_err={} ipc_err={} persisted={} persist_err={}",
            self.workers_spawned.load(Ordering::Relaxed),
            self.workers_killed.load(Ordering::Relaxed),
            self.spawn_errors.load(Ordering::Relaxed),
            self.ipc_decode_errors.load(Ordering::Relaxed),
            self.results_persisted.load(Ordering::Relaxed),
            self.persist_errors.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
