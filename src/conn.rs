//! One accepted connection.
//!
//! A [`Connection`] owns its socket and buffered stream for its whole
//! life. Between requests the manager holds it and the selector watches
//! its fd; while a request is in flight a worker holds it. Ownership is
//! transferred whole through the ready queue, so the connection is never
//! referenced from two places at once.

use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::errors::{is_benign_socket_error, ParseError, PeerCredsError};
use crate::http::headers::{DefaultHeaderReader, DropUnderscoreHeaderReader, HeaderReader};
use crate::http::request::{CycleOutcome, Exchange};
use crate::peercreds::{self, CredsCache};
use crate::server::ServerShared;
use crate::stream::{SocketStream, Transport};
use crate::tls::TlsEnv;

/// Where the peer is, transport-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    Tcp(SocketAddr),
    /// A local (filesystem or abstract) socket peer.
    Unix,
    Unknown,
}

/// Connection facts that outlive any single request.
pub struct ConnMeta {
    pub remote_addr: RemoteAddr,
    pub tls_env: Option<TlsEnv>,
    peercreds_enabled: bool,
    peercreds_resolve_enabled: bool,
    pub(crate) creds: CredsCache,
}

impl ConnMeta {
    /// Peer-credential environment for this connection.
    ///
    /// Fails with [`PeerCredsError`] on non-local sockets, when lookups
    /// are disabled, or on unsupported platforms; the caller must treat
    /// that as an internal condition, not an HTTP error.
    pub fn peer_environ(
        &self,
    ) -> Result<std::collections::BTreeMap<String, String>, PeerCredsError> {
        if !self.peercreds_enabled {
            return Err(PeerCredsError::Disabled);
        }
        let creds = self.creds.get()?;
        let names = if self.peercreds_resolve_enabled {
            Some(self.creds.resolve_names()?)
        } else {
            None
        };
        Ok(peercreds::environ(creds, names.as_ref()))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(remote_addr: RemoteAddr) -> Self {
        Self {
            remote_addr,
            tls_env: None,
            peercreds_enabled: false,
            peercreds_resolve_enabled: false,
            creds: CredsCache::new(-1, false),
        }
    }
}

pub struct Connection {
    pub(crate) stream: SocketStream,
    pub(crate) meta: ConnMeta,
    /// Last moment this connection finished being serviced or was
    /// accepted; the expiry sweep compares against it.
    pub(crate) last_used: Instant,
    requests_seen: u64,
    /// Close gently: half-close and drain unread input first, so the
    /// client can still read the tail of an error response.
    pub(crate) linger: bool,
}

impl Connection {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        remote_addr: RemoteAddr,
        tls_env: Option<TlsEnv>,
        shared: &ServerShared,
    ) -> Self {
        let fd = transport.raw_fd();
        let is_local = matches!(remote_addr, RemoteAddr::Unix);
        let cfg = &shared.config;
        let stream =
            SocketStream::with_buffer_sizes(transport, cfg.rbufsize, cfg.wbufsize);
        Self {
            stream,
            meta: ConnMeta {
                remote_addr,
                tls_env,
                peercreds_enabled: cfg.peercreds_enabled,
                peercreds_resolve_enabled: cfg.peercreds_resolve_enabled,
                creds: CredsCache::new(fd, is_local),
            },
            last_used: Instant::now(),
            requests_seen: 0,
            linger: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests_seen
    }

    pub(crate) fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.stream.raw_fd()
    }

    pub(crate) fn has_data(&mut self) -> bool {
        self.stream.has_data()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Run one request cycle. Returns true if the connection should be
    /// returned to the manager for keep-alive.
    pub fn communicate(&mut self, shared: &ServerShared) -> bool {
        let header_reader: &dyn HeaderReader = if shared.config.drop_underscore_headers {
            &DropUnderscoreHeaderReader
        } else {
            &DefaultHeaderReader
        };

        let tls = self.meta.tls_env.is_some();
        let mut exchange = Exchange::new(&mut self.stream, &shared.config, tls);
        let result = exchange.run(&self.meta, shared.gateway.as_ref(), header_reader);
        let started = exchange.started_request;
        self.linger = exchange.answered_error;

        if started {
            self.requests_seen += 1;
            crate::stats::ServerStats::inc(&shared.stats.requests);
        }

        match result {
            Ok(CycleOutcome::KeepAlive) => {
                trace!(requests = self.requests_seen, "request cycle complete, keeping alive");
                true
            }
            Ok(CycleOutcome::Close) => {
                trace!(requests = self.requests_seen, "request cycle complete, closing");
                false
            }
            Ok(CycleOutcome::StreamClosed) => {
                trace!("peer closed the stream");
                false
            }
            Err(ParseError::Io { source }) if is_benign_socket_error(&source) => {
                debug!(error = %source, "connection torn down mid-cycle");
                false
            }
            Err(ParseError::ClientDisconnect { remaining }) => {
                debug!(remaining, "client disconnected mid-request");
                false
            }
            Err(err) => {
                error!(error = %err, "unrecoverable error in request cycle");
                false
            }
        }
    }

    /// Answer the fixed 503 used when the ready queue is saturated, then
    /// mark the connection for close.
    pub(crate) fn refuse_overloaded(&mut self, shared: &ServerShared) {
        let mut exchange = Exchange::new(&mut self.stream, &shared.config, false);
        if let Err(err) = exchange.simple_response(
            http::StatusCode::SERVICE_UNAVAILABLE,
            "The server is overloaded; try again later.",
        ) {
            debug!(error = %err, "failed writing 503");
        }
        self.linger = true;
    }

    /// Close the socket.
    ///
    /// The lingering variant half-closes and briefly drains unread input
    /// first, so a just-written error response is not destroyed by the
    /// RST a full close would send while receive-queue bytes remain.
    pub(crate) fn close(mut self) {
        let _ = self.stream.flush();
        if self.linger {
            let _ = self.stream.set_timeouts(Some(std::time::Duration::from_millis(10)));
            let _ = self.stream.shutdown(Shutdown::Write);
            let mut scratch = [0u8; 1024];
            for _ in 0..16 {
                match std::io::Read::read(&mut self.stream, &mut scratch) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        } else {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        // Dropping the stream closes the fd.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayError, Request};
    use crate::http::response::Response;
    use crate::server::{ServerConfig, ServerShared};
    use crate::stream::testing::ScriptedTransport;
    use std::sync::{Arc, Mutex};

    struct Hello;

    impl Gateway for Hello {
        fn handle(&self, _req: &mut Request<'_>) -> Result<Response, GatewayError> {
            Ok(Response::text("hello"))
        }
    }

    fn shared() -> ServerShared {
        ServerShared::new(ServerConfig::default(), Box::new(Hello))
    }

    fn conn_over(input: &[u8], shared: &ServerShared) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let transport = ScriptedTransport::new(input);
        let output = transport.output.clone();
        let conn =
            Connection::new(Box::new(transport), RemoteAddr::Unknown, None, shared);
        (conn, output)
    }

    #[test]
    fn keep_alive_request_returns_true() {
        let shared = shared();
        let (mut conn, output) = conn_over(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &shared);
        assert!(conn.communicate(&shared));
        assert_eq!(conn.requests_seen(), 1);
        assert!(conn.bytes_read() >= 28);
        let wire = output.lock().unwrap();
        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(conn.bytes_written(), wire.len() as u64);
    }

    #[test]
    fn close_request_returns_false() {
        let shared = shared();
        let (mut conn, _) =
            conn_over(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n", &shared);
        assert!(!conn.communicate(&shared));
    }

    #[test]
    fn empty_stream_returns_false_without_counting() {
        let shared = shared();
        let (mut conn, output) = conn_over(b"", &shared);
        assert!(!conn.communicate(&shared));
        assert_eq!(conn.requests_seen(), 0);
        assert!(output.lock().unwrap().is_empty());
    }

    #[test]
    fn pipelined_requests_leave_buffered_data() {
        let shared = shared();
        let two = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (mut conn, _) = conn_over(two, &shared);
        assert!(conn.communicate(&shared));
        assert!(conn.has_data());
        assert!(conn.communicate(&shared));
        assert_eq!(conn.requests_seen(), 2);
    }

    #[test]
    fn overload_refusal_writes_503() {
        let shared = shared();
        let (mut conn, output) = conn_over(b"", &shared);
        conn.refuse_overloaded(&shared);
        let wire = output.lock().unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
    }
}
