//! The worker pool.
//!
//! A bounded, elastic group of OS threads, each servicing one request
//! cycle at a time. Workers block on the ready queue; a distinguished
//! shutdown sentinel drains them one by one. Connections that stay
//! keep-alive after a cycle are handed back to the manager through the
//! done channel, with a selector wake-up so the hand-off is seen
//! promptly.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use mio::Waker;
use tracing::{debug, info, trace, warn};

use crate::conn::Connection;
use crate::server::ServerShared;
use crate::stats::WorkerStats;

/// Work handed through the ready queue.
pub(crate) enum WorkItem {
    Conn(Connection),
    /// Sentinel: the receiving worker exits its loop.
    Shutdown,
}

struct WorkerHandle {
    id: u64,
    join: JoinHandle<()>,
    stats: Arc<WorkerStats>,
    /// Fd of the connection currently being serviced, or -1. `stop` uses
    /// it to interrupt a worker stuck in a blocking read.
    current_fd: Arc<AtomicI32>,
}

/// Bounded elastic pool of request workers.
pub struct WorkerPool {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    done_tx: Sender<Connection>,
    waker: Arc<Waker>,
    shared: Arc<ServerShared>,
    workers: Mutex<Vec<WorkerHandle>>,
    /// Stats of workers that have exited, kept so totals survive shrink
    /// and stop.
    retired_stats: Mutex<Vec<Arc<WorkerStats>>>,
    min: usize,
    max: Option<usize>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(
        shared: Arc<ServerShared>,
        done_tx: Sender<Connection>,
        waker: Arc<Waker>,
    ) -> Self {
        let cfg = &shared.config;
        let (tx, rx) = match cfg.accepted_queue_size {
            Some(bound) => crossbeam_channel::bounded(bound.max(1)),
            None => crossbeam_channel::unbounded(),
        };
        Self {
            tx,
            rx,
            done_tx,
            waker,
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
            retired_stats: Mutex::new(Vec::new()),
            min: cfg.min_threads.max(1),
            max: cfg.max_threads,
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawn the minimum worker complement.
    pub fn start(&self) {
        self.grow(self.min);
    }

    /// Live worker count.
    pub fn size(&self) -> usize {
        let mut workers = self.workers.lock().unwrap();
        self.reap(&mut workers);
        workers.len()
    }

    /// Remove exited workers, keeping their stats.
    fn reap(&self, workers: &mut Vec<WorkerHandle>) {
        let mut i = 0;
        while i < workers.len() {
            if workers[i].join.is_finished() {
                let worker = workers.remove(i);
                let _ = worker.join.join();
                self.retired_stats.lock().unwrap().push(worker.stats);
            } else {
                i += 1;
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    pub fn can_grow(&self) -> bool {
        match self.max {
            Some(max) => self.size() < max,
            None => true,
        }
    }

    /// Spawn up to `n` fresh workers, bounded by `max`.
    pub fn grow(&self, n: usize) {
        let mut workers = self.workers.lock().unwrap();
        self.reap(&mut workers);
        for _ in 0..n {
            if let Some(max) = self.max {
                if workers.len() >= max {
                    break;
                }
            }
            workers.push(self.spawn_worker());
        }
        trace!(size = workers.len(), "pool grown");
    }

    /// Ask up to `n` workers to exit, never dropping below `min`.
    pub fn shrink(&self, n: usize) {
        let size = self.size();
        let headroom = size.saturating_sub(self.min);
        let count = n.min(headroom);
        for _ in 0..count {
            if self.tx.send(WorkItem::Shutdown).is_err() {
                break;
            }
        }
        debug!(count, "pool shrink requested");
    }

    /// Offer a ready connection to the queue, waiting at most `timeout`.
    /// The connection comes back on refusal so the caller can answer 503.
    pub(crate) fn try_put(
        &self,
        conn: Connection,
        timeout: Duration,
    ) -> Result<(), Connection> {
        match self.tx.send_timeout(WorkItem::Conn(conn), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(WorkItem::Conn(conn)))
            | Err(SendTimeoutError::Disconnected(WorkItem::Conn(conn))) => Err(conn),
            Err(_) => unreachable!("sentinels are never offered through try_put"),
        }
    }

    /// Drain and join every worker.
    ///
    /// Each live worker is sent a sentinel, then joined until `timeout`
    /// expires; stragglers get their current socket shut down to break a
    /// blocking read, and anything still alive after that is detached.
    pub fn stop(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let workers: Vec<WorkerHandle> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        {
            let mut retired = self.retired_stats.lock().unwrap();
            retired.extend(workers.iter().map(|w| w.stats.clone()));
        }

        for _ in 0..workers.len() {
            if self.tx.send(WorkItem::Shutdown).is_err() {
                break;
            }
        }

        let mut stragglers = Vec::new();
        for worker in workers {
            if join_until(&worker.join, deadline) {
                let _ = worker.join.join();
            } else {
                stragglers.push(worker);
            }
        }

        // Break blocking reads by shutting down the socket under them.
        for worker in &stragglers {
            let fd = worker.current_fd.load(Ordering::SeqCst);
            if fd >= 0 {
                debug!(worker = worker.id, fd, "interrupting stuck worker");
                unsafe {
                    libc::shutdown(fd, libc::SHUT_RDWR);
                }
            }
        }
        let grace = Instant::now() + Duration::from_millis(250);
        for worker in stragglers {
            if join_until(&worker.join, grace) {
                let _ = worker.join.join();
            } else {
                warn!(worker = worker.id, "worker did not exit; detaching");
            }
        }
        info!("worker pool stopped");
    }

    pub(crate) fn with_worker_stats<R>(
        &self,
        f: impl FnOnce(&mut dyn Iterator<Item = &WorkerStats>) -> R,
    ) -> R {
        let workers = self.workers.lock().unwrap();
        let retired = self.retired_stats.lock().unwrap();
        let mut iter = workers
            .iter()
            .map(|w| w.stats.as_ref())
            .chain(retired.iter().map(|s| s.as_ref()));
        f(&mut iter)
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(WorkerStats::new());
        let current_fd = Arc::new(AtomicI32::new(-1));

        let rx = self.rx.clone();
        let done_tx = self.done_tx.clone();
        let waker = self.waker.clone();
        let shared = self.shared.clone();
        let worker_stats = stats.clone();
        let worker_fd = current_fd.clone();

        let join = thread::Builder::new()
            .name(format!("berth-worker-{id}"))
            .spawn(move || worker_loop(id, rx, done_tx, waker, shared, worker_stats, worker_fd))
            .expect("spawning a worker thread");

        WorkerHandle { id, join, stats, current_fd }
    }
}

fn join_until(handle: &JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn worker_loop(
    id: u64,
    rx: Receiver<WorkItem>,
    done_tx: Sender<Connection>,
    waker: Arc<Waker>,
    shared: Arc<ServerShared>,
    stats: Arc<WorkerStats>,
    current_fd: Arc<AtomicI32>,
) {
    trace!(worker = id, "worker started");
    loop {
        let mut conn = match rx.recv() {
            Ok(WorkItem::Conn(conn)) => conn,
            Ok(WorkItem::Shutdown) => break,
            // The server dropped the queue.
            Err(_) => break,
        };

        current_fd.store(conn.raw_fd(), Ordering::SeqCst);
        let started = Instant::now();
        let read_before = conn.bytes_read();
        let written_before = conn.bytes_written();
        let requests_before = conn.requests_seen();

        let keep_alive = conn.communicate(&shared);

        stats
            .requests
            .fetch_add(conn.requests_seen() - requests_before, Ordering::Relaxed);
        stats.bytes_read.fetch_add(conn.bytes_read() - read_before, Ordering::Relaxed);
        stats
            .bytes_written
            .fetch_add(conn.bytes_written() - written_before, Ordering::Relaxed);
        stats
            .work_time_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        current_fd.store(-1, Ordering::SeqCst);

        if keep_alive {
            conn.touch();
            match done_tx.send(conn) {
                Ok(()) => {
                    let _ = waker.wake();
                }
                // Manager is gone; nothing to return to.
                Err(err) => err.into_inner().close(),
            }
        } else {
            conn.close();
        }
    }
    trace!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayError, Request};
    use crate::http::response::Response;
    use crate::server::{ServerConfig, ServerShared};

    struct Hello;

    impl Gateway for Hello {
        fn handle(&self, _req: &mut Request<'_>) -> Result<Response, GatewayError> {
            Ok(Response::text("hello"))
        }
    }

    fn pool_with(min: usize, max: Option<usize>) -> (WorkerPool, Receiver<Connection>) {
        let config = ServerConfig {
            min_threads: min,
            max_threads: max,
            accepted_queue_size: Some(4),
            ..ServerConfig::default()
        };
        let shared = Arc::new(ServerShared::new(config, Box::new(Hello)));
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), mio::Token(1)).unwrap());
        (WorkerPool::new(shared, done_tx, waker), done_rx)
    }

    #[test]
    fn start_spawns_min_workers() {
        let (pool, _done) = pool_with(3, None);
        pool.start();
        assert_eq!(pool.size(), 3);
        pool.stop(Duration::from_secs(2));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn grow_respects_max() {
        let (pool, _done) = pool_with(1, Some(2));
        pool.start();
        pool.grow(10);
        assert_eq!(pool.size(), 2);
        assert!(!pool.can_grow());
        pool.stop(Duration::from_secs(2));
    }

    #[test]
    fn shrink_never_drops_below_min() {
        let (pool, _done) = pool_with(2, None);
        pool.start();
        pool.grow(2);
        assert_eq!(pool.size(), 4);
        pool.shrink(10);
        // Give the sentinels a moment to land.
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.size() > 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.size(), 2);
        pool.stop(Duration::from_secs(2));
    }

    #[test]
    fn stop_twice_is_idempotent() {
        let (pool, _done) = pool_with(2, None);
        pool.start();
        pool.stop(Duration::from_secs(2));
        pool.stop(Duration::from_secs(2));
        assert_eq!(pool.size(), 0);
    }
}
