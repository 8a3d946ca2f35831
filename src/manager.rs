//! The connection manager: a single-threaded selector loop.
//!
//! The loop owns every live socket. It registers the listener and all
//! idle keep-alive connections for readability, accepts in bursts,
//! TLS-wraps at accept time, and hands readable connections to the worker
//! pool through the bounded ready queue. Workers return keep-alive
//! connections through the done channel, waking the selector; a returned
//! connection with bytes already buffered skips the selector entirely so
//! pipelined requests are serviced without an extra poll cycle.
//!
//! The manager never runs application code and never blocks on the pool
//! longer than `accepted_queue_timeout`.

use std::io;
use std::time::Instant;

use crossbeam_channel::Receiver;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::conn::{Connection, RemoteAddr};
use crate::errors::Error;
use crate::pool::WorkerPool;
use crate::server::{Accepted, Listener, ServerShared, ServerState};
use crate::stats::ServerStats;
use crate::stream::Transport;
use crate::tls::{TlsAdapter, TlsError, Wrapped};

pub(crate) const TOKEN_LISTENER: Token = Token(0);
pub(crate) const TOKEN_WAKER: Token = Token(1);
const CONN_BASE: usize = 2;

/// Cap on accepts per loop iteration so one burst cannot starve the
/// already-connected.
const ACCEPT_PER_TICK: usize = 100;

pub struct ConnectionManager {
    poll: Poll,
    listener: Listener,
    pool: Arc<WorkerPool>,
    done_rx: Receiver<Connection>,
    /// Keep-alive idle set, slab key + `CONN_BASE` = selector token.
    idle: Slab<Connection>,
    shared: Arc<ServerShared>,
    state: Arc<ServerState>,
    tls: Option<Arc<dyn TlsAdapter>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        poll: Poll,
        listener: Listener,
        pool: Arc<WorkerPool>,
        done_rx: Receiver<Connection>,
        shared: Arc<ServerShared>,
        state: Arc<ServerState>,
        tls: Option<Arc<dyn TlsAdapter>>,
    ) -> Self {
        Self { poll, listener, pool, done_rx, idle: Slab::new(), shared, state, tls }
    }

    /// Run until the serving flag drops, then tear everything down.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let listener_fd = self.listener.raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&listener_fd), TOKEN_LISTENER, Interest::READABLE)?;
        info!("connection manager serving");

        let mut events = Events::with_capacity(256);
        while self.state.is_serving() {
            match self.poll.poll(&mut events, Some(self.shared.config.expiration_interval)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            }

            for event in events.iter() {
                match event.token() {
                    TOKEN_LISTENER => self.accept_burst(),
                    // The waker exists only to get us past poll(); the
                    // done queue is drained below either way.
                    TOKEN_WAKER => {}
                    Token(token) => self.dispatch(token - CONN_BASE),
                }
            }

            self.drain_done();
            self.expire();
        }

        self.shutdown();
        Ok(())
    }

    /// Idle-set capacity left under `keep_alive_conn_limit`.
    fn below_keep_alive_limit(&self) -> bool {
        match self.shared.config.keep_alive_conn_limit {
            Some(limit) => self.idle.len() < limit,
            None => true,
        }
    }

    fn accept_burst(&mut self) {
        for _ in 0..ACCEPT_PER_TICK {
            if !self.below_keep_alive_limit() {
                // Leave the rest in the OS backlog for the next tick.
                break;
            }
            match self.listener.accept() {
                Ok(accepted) => self.take_accepted(accepted),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    ServerStats::inc(&self.shared.stats.socket_errors);
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn take_accepted(&mut self, accepted: Accepted) {
        ServerStats::inc(&self.shared.stats.accepts);
        let (transport, remote_addr, tls_env): (Box<dyn Transport>, _, _) = match accepted {
            Accepted::Tcp(sock, addr) => {
                let _ = sock.set_nodelay(self.shared.config.nodelay);
                match &self.tls {
                    None => (Box::new(sock), RemoteAddr::Tcp(addr), None),
                    Some(adapter) => match adapter.wrap(sock) {
                        Ok(Wrapped::Tls(transport, env)) => {
                            (transport, RemoteAddr::Tcp(addr), Some(env))
                        }
                        Ok(Wrapped::PlainHttp(sock)) => {
                            self.reject_plain_http(sock);
                            return;
                        }
                        Err(TlsError::Benign { reason }) => {
                            trace!(reason, "handshake abandoned");
                            return;
                        }
                        Err(err) => {
                            ServerStats::inc(&self.shared.stats.socket_errors);
                            warn!(error = %err, "dropping connection after TLS failure");
                            return;
                        }
                    },
                }
            }
            Accepted::Unix(sock) => (Box::new(sock), RemoteAddr::Unix, None),
        };

        let mut conn = Connection::new(transport, remote_addr, tls_env, &self.shared);
        if let Err(e) = conn.stream.set_timeouts(Some(self.shared.config.timeout)) {
            debug!(error = %e, "could not arm socket timeouts");
        }
        // A TLS handshake can leave early request plaintext already
        // decrypted; the selector would never fire for it.
        if conn.has_data() {
            self.hand_to_pool(conn);
        } else {
            self.park(conn);
        }
    }

    /// Answer a plain-HTTP client on a TLS port with a readable refusal.
    fn reject_plain_http(&self, mut sock: std::net::TcpStream) {
        use std::io::{Read, Write};
        let msg = "The client sent a plain HTTP request, but this server \
                   speaks HTTPS on this port.";
        let response = format!(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\n\
             Content-Type: text/plain\r\nConnection: close\r\n\r\n{}",
            msg.len(),
            msg
        );
        if let Err(e) = sock.write_all(response.as_bytes()) {
            debug!(error = %e, "could not deliver plain-HTTP refusal");
        }
        // The request was only ever peeked; drain it briefly so the close
        // sends FIN rather than an RST that would outrun the refusal.
        let _ = sock.set_read_timeout(Some(std::time::Duration::from_millis(10)));
        let _ = sock.shutdown(std::net::Shutdown::Write);
        let mut scratch = [0u8; 1024];
        for _ in 0..16 {
            match sock.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    /// Register a connection in the idle set and the selector.
    fn park(&mut self, conn: Connection) {
        let fd = conn.raw_fd();
        let entry = self.idle.vacant_entry();
        let token = Token(entry.key() + CONN_BASE);
        match self.poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE) {
            Ok(()) => {
                trace!(?token, "connection parked");
                entry.insert(conn);
            }
            Err(e) => {
                warn!(error = %e, "selector registration failed; closing connection");
                conn.close();
            }
        }
    }

    /// A parked connection became readable: unpark and hand it over.
    fn dispatch(&mut self, key: usize) {
        // Spurious events for just-removed keys are possible after close.
        if !self.idle.contains(key) {
            return;
        }
        let conn = self.idle.remove(key);
        self.deregister(&conn);
        self.hand_to_pool(conn);
    }

    fn deregister(&self, conn: &Connection) {
        let fd = conn.raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!(error = %e, "selector deregistration failed");
        }
    }

    fn hand_to_pool(&mut self, mut conn: Connection) {
        conn.touch();
        let timeout = self.shared.config.accepted_queue_timeout;
        match self.pool.try_put(conn, timeout) {
            Ok(()) => {}
            Err(conn) => {
                // The queue is saturated. Elastic first: add a worker and
                // retry once. Only at the hard ceiling do we refuse.
                if self.pool.can_grow() {
                    self.pool.grow(1);
                    match self.pool.try_put(conn, timeout) {
                        Ok(()) => return,
                        Err(conn) => self.refuse(conn),
                    }
                } else {
                    self.refuse(conn);
                }
            }
        }
    }

    fn refuse(&self, mut conn: Connection) {
        ServerStats::inc(&self.shared.stats.queue_full_rejections);
        warn!("ready queue saturated at max workers; answering 503");
        conn.refuse_overloaded(&self.shared);
        conn.close();
    }

    /// Reclaim keep-alive connections the workers handed back.
    fn drain_done(&mut self) {
        while let Ok(mut conn) = self.done_rx.try_recv() {
            if !self.state.is_serving() {
                conn.close();
                continue;
            }
            if conn.has_data() {
                // Pipelined bytes are already buffered; the selector
                // would never fire for them.
                self.hand_to_pool(conn);
            } else if self.below_keep_alive_limit() {
                self.park(conn);
            } else {
                debug!("keep-alive limit reached; closing returned connection");
                conn.close();
            }
        }
    }

    /// Close idle connections whose inactivity exceeded the timeout.
    fn expire(&mut self) {
        let timeout = self.shared.config.timeout;
        let now = Instant::now();
        let expired: Vec<usize> = self
            .idle
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_used) > timeout)
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            let conn = self.idle.remove(key);
            self.deregister(&conn);
            debug!("expiring idle connection");
            conn.close();
        }
    }

    /// Stop accepting, drop idle connections, stop the pool.
    fn shutdown(&mut self) {
        info!("connection manager shutting down");
        let listener_fd = self.listener.raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&listener_fd));
        self.listener.cleanup();

        for (_, conn) in std::mem::take(&mut self.idle) {
            self.deregister(&conn);
            conn.close();
        }

        // Workers may still be returning connections.
        while let Ok(conn) = self.done_rx.try_recv() {
            conn.close();
        }

        self.pool.stop(self.shared.config.shutdown_timeout);

        while let Ok(conn) = self.done_rx.try_recv() {
            conn.close();
        }
    }
}
