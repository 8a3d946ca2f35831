//! A thread-pooled, selector-driven HTTP/1.x connection engine.
//!
//! The crate owns sockets, wire-format parsing, connection lifetime, TLS
//! termination and worker scheduling, and hands each parsed request to a
//! pluggable [`Gateway`]. It is the request-facing I/O layer for a
//! higher-level web framework; routing, caching and content negotiation
//! live above it.
//!
//! The moving parts, leaf first:
//!
//! - [`stream`]: a buffered duplex stream over one socket, plus the three
//!   framed body readers (size-capped head, known length, chunked).
//! - [`http`]: the request cycle state machine: request line, headers,
//!   body framing, response writing with chunked encoding and keep-alive.
//! - [`tls`]: the adapter contract for wrapping accepted sockets and
//!   exposing peer-certificate metadata.
//! - [`peercreds`]: PID/UID/GID of local-socket peers.
//! - [`conn`]: one accepted socket, serviced once per request cycle.
//! - [`pool`]: a bounded, elastic group of worker threads draining a queue
//!   of ready connections.
//! - [`manager`]: the single-threaded selector loop that owns every live
//!   socket and dispatches readable ones to the pool.
//! - [`server`]: lifecycle (bind, serve, shutdown).
//!
//! A connection is owned by exactly one party at a time: the manager while
//! idle, a worker while a request is in flight. The bounded ready queue is
//! the only structure shared between them.
//!
//! ```no_run
//! use berth::{BindAddr, Gateway, HttpServer, Request, Response};
//!
//! struct Hello;
//!
//! impl Gateway for Hello {
//!     fn handle(&self, _req: &mut Request<'_>) -> Result<Response, berth::GatewayError> {
//!         Ok(Response::text("hello"))
//!     }
//! }
//!
//! let mut server = HttpServer::new(BindAddr::tcp("127.0.0.1", 8080), Hello);
//! server.start().unwrap();
//! ```

pub mod conn;
pub mod errors;
pub mod gateway;
pub mod http;
pub mod manager;
pub mod peercreds;
pub mod pool;
pub mod server;
pub mod stats;
pub mod stream;
pub mod tls;

pub use crate::conn::Connection;
pub use crate::errors::{Error, ParseError, PeerCredsError, TlsError};
pub use crate::gateway::{Gateway, GatewayError, Request};
pub use crate::http::response::{Response, ResponseBody};
pub use crate::server::{BindAddr, BoundAddr, HttpServer, ServerConfig, ServerHandle};
pub use crate::stats::{ServerStats, StatsSnapshot};
pub use crate::tls::{TlsAdapter, TlsEnv};

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}
