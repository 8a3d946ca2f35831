//! Server lifecycle: bind, serve, shutdown.
//!
//! [`HttpServer`] owns the configuration, the gateway, the worker pool
//! and the connection manager. `prepare()` resolves the bind address and
//! opens the listening socket, `serve()` runs the manager loop on the
//! calling thread until stopped, `start()` is the two in sequence. A
//! [`ServerHandle`] taken before `start()` stops or interrupts the server
//! from another thread.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::{Poll, Waker};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::errors::Error;
use crate::gateway::Gateway;
use crate::manager::{ConnectionManager, TOKEN_WAKER};
use crate::pool::WorkerPool;
use crate::stats::{ServerStats, StatsSnapshot};
use crate::tls::TlsAdapter;

/// Everything a request cycle needs from the server, shared between the
/// manager thread and the workers.
pub struct ServerShared {
    pub config: ServerConfig,
    pub gateway: Box<dyn Gateway>,
    pub stats: ServerStats,
}

impl ServerShared {
    pub(crate) fn new(config: ServerConfig, gateway: Box<dyn Gateway>) -> Self {
        Self { config, gateway, stats: ServerStats::default() }
    }
}

/// Server construction knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised in the `Server` response header.
    pub server_name: String,
    /// Per-request inactivity limit; also the keep-alive idle deadline.
    pub timeout: Duration,
    /// How long `stop` waits for workers to exit cleanly.
    pub shutdown_timeout: Duration,
    /// Selector tick granularity; the idle sweep runs at most this often.
    pub expiration_interval: Duration,
    /// Request line plus header block cap in bytes; 0 for no limit.
    pub max_request_header_size: usize,
    /// Request body cap in bytes; 0 for no limit.
    pub max_request_body_size: u64,
    /// Worker pool floor.
    pub min_threads: usize,
    /// Worker pool ceiling; `None` is unbounded up to OS limits.
    pub max_threads: Option<usize>,
    /// OS listen backlog.
    pub request_queue_size: i32,
    /// TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
    /// SO_REUSEPORT on the listener where supported.
    pub reuse_port: bool,
    pub peercreds_enabled: bool,
    pub peercreds_resolve_enabled: bool,
    /// Ready-queue capacity; `None` is unbounded.
    pub accepted_queue_size: Option<usize>,
    /// Longest the manager blocks handing one connection to the queue.
    pub accepted_queue_timeout: Duration,
    /// Most keep-alive idle connections tracked concurrently.
    pub keep_alive_conn_limit: Option<usize>,
    /// Accept proxy request forms (absolute-form for any method,
    /// authority-form CONNECT).
    pub proxy_mode: bool,
    /// Install the underscore-dropping header reader.
    pub drop_underscore_headers: bool,
    pub rbufsize: usize,
    pub wbufsize: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: concat!("berth/", env!("CARGO_PKG_VERSION")).to_owned(),
            timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            expiration_interval: Duration::from_millis(500),
            max_request_header_size: 0,
            max_request_body_size: 0,
            min_threads: 10,
            max_threads: None,
            request_queue_size: 128,
            nodelay: true,
            reuse_port: false,
            peercreds_enabled: false,
            peercreds_resolve_enabled: false,
            accepted_queue_size: Some(64),
            accepted_queue_timeout: Duration::from_millis(100),
            keep_alive_conn_limit: Some(512),
            proxy_mode: false,
            drop_underscore_headers: false,
            rbufsize: crate::stream::DEFAULT_BUFFER_SIZE,
            wbufsize: crate::stream::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Where to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// TCP host and port; IPv4, IPv6 or a resolvable hostname. Port 0
    /// requests an ephemeral port, discoverable after `prepare`.
    Tcp { host: String, port: u16 },
    /// Filesystem local socket, chmodded to `mode` after bind.
    Unix { path: PathBuf, mode: Option<u32> },
    /// Abstract-namespace local socket (Linux).
    Abstract { name: Vec<u8> },
}

impl BindAddr {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp { host: host.into(), port }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into(), mode: None }
    }

    pub fn unix_with_mode(path: impl Into<PathBuf>, mode: u32) -> Self {
        Self::Unix { path: path.into(), mode: Some(mode) }
    }

    /// A leading NUL byte selects the abstract namespace, as in the
    /// classic notation.
    pub fn local(name: impl AsRef<[u8]>) -> Self {
        let name = name.as_ref();
        match name.first() {
            Some(0) => Self::Abstract { name: name[1..].to_vec() },
            _ => Self::Unix { path: PathBuf::from(String::from_utf8_lossy(name).as_ref()), mode: None },
        }
    }
}

impl std::fmt::Display for BindAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix { path, .. } => write!(f, "{}", path.display()),
            Self::Abstract { name } => write!(f, "\\0{}", String::from_utf8_lossy(name)),
        }
    }
}

/// The address actually bound, ephemeral port resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Abstract(Vec<u8>),
}

impl BoundAddr {
    /// The TCP socket address, if this is a TCP bind.
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// The listening socket, nonblocking, registered with the selector.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, Option<PathBuf>),
}

/// One accepted transport, still blocking-mode.
pub(crate) enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl Listener {
    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix(listener, _) => listener.as_raw_fd(),
        }
    }

    pub(crate) fn accept(&self) -> io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (sock, addr) = listener.accept()?;
                sock.set_nonblocking(false)?;
                Ok(Accepted::Tcp(sock, addr))
            }
            Self::Unix(listener, _) => {
                let (sock, _) = listener.accept()?;
                sock.set_nonblocking(false)?;
                Ok(Accepted::Unix(sock))
            }
        }
    }

    /// Release filesystem residue on shutdown.
    pub(crate) fn cleanup(&self) {
        if let Self::Unix(_, Some(path)) = self {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(error = %e, path = %path.display(), "could not unlink socket path");
            }
        }
    }
}

/// Cross-cutting serving state shared with handles.
pub(crate) struct ServerState {
    serving: AtomicBool,
    ready: AtomicBool,
    running: Mutex<bool>,
    stopped_cv: Condvar,
    interrupt: Mutex<Option<Box<dyn std::error::Error + Send + Sync>>>,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            serving: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            running: Mutex::new(false),
            stopped_cv: Condvar::new(),
            interrupt: Mutex::new(None),
            waker: Mutex::new(None),
        }
    }

    pub(crate) fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.serving.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            let _ = waker.wake();
        }
    }

    fn set_interrupt(&self, err: Box<dyn std::error::Error + Send + Sync>) {
        *self.interrupt.lock().unwrap() = Some(err);
        self.request_stop();
    }

    fn take_interrupt(&self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.interrupt.lock().unwrap().take()
    }

    fn mark_running(&self) {
        *self.running.lock().unwrap() = true;
    }

    fn mark_stopped(&self) {
        *self.running.lock().unwrap() = false;
        self.stopped_cv.notify_all();
    }

    fn wait_stopped(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        let mut running = self.running.lock().unwrap();
        while *running {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                warn!("server did not stop within the grace period");
                return;
            }
            let (guard, _) = self.stopped_cv.wait_timeout(running, remaining).unwrap();
            running = guard;
        }
    }
}

struct Prepared {
    listener: Listener,
    poll: Poll,
    pool: Arc<WorkerPool>,
    done_rx: Receiver<Connection>,
}

/// The HTTP server: socket ownership, worker scheduling, lifecycle.
pub struct HttpServer {
    bind_addr: BindAddr,
    pub config: ServerConfig,
    ssl_adapter: Option<Arc<dyn TlsAdapter>>,
    gateway: Option<Box<dyn Gateway>>,
    state: Arc<ServerState>,
    shared: Option<Arc<ServerShared>>,
    pool: Option<Arc<WorkerPool>>,
    prepared: Option<Prepared>,
    bound_addr: Option<BoundAddr>,
}

impl HttpServer {
    pub fn new(bind_addr: BindAddr, gateway: impl Gateway) -> Self {
        Self {
            bind_addr,
            config: ServerConfig::default(),
            ssl_adapter: None,
            gateway: Some(Box::new(gateway)),
            state: Arc::new(ServerState::new()),
            shared: None,
            pool: None,
            prepared: None,
            bound_addr: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a TLS adapter; connections will be wrapped at accept time.
    pub fn with_ssl_adapter(mut self, adapter: Arc<dyn TlsAdapter>) -> Self {
        self.ssl_adapter = Some(adapter);
        self
    }

    /// A handle for stopping or interrupting from another thread. Take it
    /// before moving the server into its serving thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.clone(),
            grace: self.config.shutdown_timeout + self.config.expiration_interval
                + Duration::from_secs(1),
        }
    }

    /// The address actually bound, available after `prepare`.
    pub fn local_addr(&self) -> Option<&BoundAddr> {
        self.bound_addr.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        match (&self.shared, &self.pool) {
            (Some(shared), Some(pool)) => {
                pool.with_worker_stats(|iter| StatsSnapshot::collect(&shared.stats, iter))
            }
            (Some(shared), None) => {
                StatsSnapshot::collect(&shared.stats, std::iter::empty())
            }
            _ => StatsSnapshot::default(),
        }
    }

    /// Bind the listening socket, start the worker pool, become ready.
    pub fn prepare(&mut self) -> Result<(), Error> {
        if self.prepared.is_some() {
            return Ok(());
        }

        let gateway = self
            .gateway
            .take()
            .expect("prepare called after the gateway was consumed");
        let shared = Arc::new(ServerShared::new(self.config.clone(), gateway));

        let (listener, bound) = self.bind_listener()?;
        if let (Some(adapter), Listener::Tcp(tcp)) = (&self.ssl_adapter, &listener) {
            adapter.bind(tcp)?;
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKER)?);
        *self.state.waker.lock().unwrap() = Some(waker.clone());

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let pool = Arc::new(WorkerPool::new(shared.clone(), done_tx, waker));
        pool.start();

        info!(addr = %self.bind_addr, "listening");
        self.bound_addr = Some(bound);
        self.shared = Some(shared);
        self.pool = Some(pool.clone());
        self.prepared = Some(Prepared { listener, poll, pool, done_rx });

        self.state.serving.store(true, Ordering::SeqCst);
        self.state.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run the connection manager until stopped. Re-raises an externally
    /// assigned interrupt after cleanup; a clean stop returns `Ok`.
    pub fn serve(&mut self) -> Result<(), Error> {
        if self.prepared.is_none() {
            self.prepare()?;
        }
        let prepared = self.prepared.take().expect("prepared above");
        let shared = self.shared.clone().expect("shared set in prepare");

        self.state.mark_running();
        let mut manager = ConnectionManager::new(
            prepared.poll,
            prepared.listener,
            prepared.pool,
            prepared.done_rx,
            shared,
            self.state.clone(),
            self.ssl_adapter.clone(),
        );
        let result = manager.run();
        drop(manager);

        self.state.ready.store(false, Ordering::SeqCst);
        self.state.serving.store(false, Ordering::SeqCst);
        self.state.mark_stopped();

        if let Some(interrupt) = self.state.take_interrupt() {
            return Err(Error::Interrupted(interrupt));
        }
        result
    }

    /// `prepare()` then `serve()`.
    pub fn start(&mut self) -> Result<(), Error> {
        self.prepare()?;
        self.serve()
    }

    /// Stop serving and wait for the manager and workers to wind down.
    /// Idempotent: a second call finds nothing running and returns.
    pub fn stop(&self) {
        self.handle().stop();
    }

    fn bind_listener(&self) -> Result<(Listener, BoundAddr), Error> {
        match &self.bind_addr {
            BindAddr::Tcp { host, port } => self.bind_tcp(host, *port),
            BindAddr::Unix { path, mode } => self.bind_unix(path, *mode),
            BindAddr::Abstract { name } => self.bind_abstract(name),
        }
    }

    fn bind_tcp(&self, host: &str, port: u16) -> Result<(Listener, BoundAddr), Error> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Bind { addr: format!("{host}:{port}"), source: e })?
            .collect();

        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match self.try_bind_tcp_addr(host, addr) {
                Ok(listener) => {
                    let bound = listener
                        .local_addr()
                        .map_err(|e| Error::Bind { addr: addr.to_string(), source: e })?;
                    return Ok((Listener::Tcp(listener), BoundAddr::Tcp(bound)));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "bind candidate failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Bind {
            addr: format!("{host}:{port}"),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses")),
        })
    }

    fn try_bind_tcp_addr(&self, host: &str, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        // Windows gives SO_REUSEADDR different (unsafe) semantics, and on
        // an ephemeral port it can steal someone else's; skip it there.
        let is_ephemeral = addr.port() == 0;
        if !cfg!(windows) && !is_ephemeral {
            socket.set_reuse_address(true)?;
        }
        if self.config.reuse_port {
            #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
            socket.set_reuse_port(true)?;
        }
        if addr.is_ipv6() && matches!(host, "::" | "::0" | "::0.0.0.0") {
            // Dual-stack for the IPv6 any-address where the stack allows.
            if let Err(e) = socket.set_only_v6(false) {
                debug!(error = %e, "could not clear IPV6_V6ONLY");
            }
        }

        socket.bind(&SockAddr::from(addr))?;
        socket.listen(self.config.request_queue_size)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn bind_unix(&self, path: &PathBuf, mode: Option<u32>) -> Result<(Listener, BoundAddr), Error> {
        let context = |e: io::Error| Error::Bind { addr: path.display().to_string(), source: e };

        // Reusing the path is the point; stale sockets are the norm.
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(context(e)),
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(context)?;
        let sock_addr = SockAddr::unix(path).map_err(context)?;
        socket.bind(&sock_addr).map_err(context)?;
        socket.listen(self.config.request_queue_size).map_err(context)?;
        socket.set_nonblocking(true).map_err(context)?;

        let permissions = std::fs::Permissions::from_mode(mode.unwrap_or(0o777));
        if let Err(e) = std::fs::set_permissions(path, permissions) {
            warn!(error = %e, "could not set socket fs mode");
        }

        let listener: UnixListener = socket.into();
        Ok((Listener::Unix(listener, Some(path.clone())), BoundAddr::Unix(path.clone())))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn bind_abstract(&self, name: &[u8]) -> Result<(Listener, BoundAddr), Error> {
        use std::os::linux::net::SocketAddrExt;

        let context = |e: io::Error| Error::Bind {
            addr: format!("\\0{}", String::from_utf8_lossy(name)),
            source: e,
        };
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name).map_err(context)?;
        let listener = UnixListener::bind_addr(&addr).map_err(context)?;
        listener.set_nonblocking(true).map_err(context)?;
        Ok((Listener::Unix(listener, None), BoundAddr::Abstract(name.to_vec())))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn bind_abstract(&self, name: &[u8]) -> Result<(Listener, BoundAddr), Error> {
        Err(Error::Bind {
            addr: format!("\\0{}", String::from_utf8_lossy(name)),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "abstract-namespace sockets require Linux",
            ),
        })
    }
}

/// Stops or interrupts a server from outside its serving thread.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    grace: Duration,
}

impl ServerHandle {
    /// Request a stop and wait for the serve loop to finish cleanup.
    pub fn stop(&self) {
        self.state.request_stop();
        self.state.wait_stopped(self.grace);
    }

    /// Assign an interrupt: the server shuts down and `serve()` returns
    /// `Error::Interrupted` carrying this payload.
    pub fn interrupt(&self, err: Box<dyn std::error::Error + Send + Sync>) {
        self.state.set_interrupt(err);
        self.state.wait_stopped(self.grace);
    }
}
