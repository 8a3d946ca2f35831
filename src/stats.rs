//! Per-process statistics.
//!
//! Counters are plain atomics updated from the manager thread and the
//! workers; gauges are derived at snapshot time. Nothing here is on a hot
//! enough path to need more than `Relaxed` ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide counters, owned by the shared server state.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub accepts: AtomicU64,
    pub socket_errors: AtomicU64,
    pub requests: AtomicU64,
    pub queue_full_rejections: AtomicU64,
}

impl ServerStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters owned by one worker thread.
#[derive(Debug)]
pub struct WorkerStats {
    pub requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub work_time_micros: AtomicU64,
    pub started_at: Instant,
}

impl WorkerStats {
    pub(crate) fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            work_time_micros: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

/// A point-in-time view of the server counters, worker totals folded in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepts: u64,
    pub socket_errors: u64,
    pub requests: u64,
    pub queue_full_rejections: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub workers: usize,
}

impl StatsSnapshot {
    pub(crate) fn collect<'a>(
        server: &ServerStats,
        workers: impl Iterator<Item = &'a WorkerStats>,
    ) -> Self {
        let mut snapshot = Self {
            accepts: server.accepts.load(Ordering::Relaxed),
            socket_errors: server.socket_errors.load(Ordering::Relaxed),
            requests: server.requests.load(Ordering::Relaxed),
            queue_full_rejections: server.queue_full_rejections.load(Ordering::Relaxed),
            ..Self::default()
        };
        for worker in workers {
            snapshot.bytes_read += worker.bytes_read.load(Ordering::Relaxed);
            snapshot.bytes_written += worker.bytes_written.load(Ordering::Relaxed);
            snapshot.workers += 1;
        }
        snapshot
    }
}
