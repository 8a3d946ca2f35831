//! Error types for the connection engine.
//!
//! The taxonomy follows the layers of the engine:
//!
//! - [`ParseError`]: client-protocol errors detected by the request state
//!   machine. Each maps to an HTTP status and is answered in-band with a
//!   fixed error body before the connection is closed.
//! - [`TlsError`]: handshake-time failures from a TLS adapter.
//! - [`PeerCredsError`]: peer-credential lookups that cannot be satisfied.
//! - [`Error`]: the top-level error surfaced from server lifecycle calls.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// The top-level error type for server lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket creation, bind or listen failed.
    #[error("no socket could be created on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// An externally assigned interrupt was re-raised out of `serve()`.
    #[error("server interrupted: {0}")]
    Interrupted(Box<dyn std::error::Error + Send + Sync>),

    /// TLS adapter configuration failed before serving started.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// I/O error outside an individual connection.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Errors raised while parsing a request or framing its body.
///
/// Every variant carries enough context for the fixed error response; the
/// status mapping lives in [`ParseError::status`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The request line could not be understood.
    #[error("malformed request line: {reason}")]
    InvalidRequestLine { reason: String },

    /// The request line exceeded `max_request_header_size`.
    #[error("request line exceeds the limit of {max} bytes")]
    UriTooLong { max: usize },

    /// The header block exceeded `max_request_header_size`.
    #[error("request header block exceeds the limit of {max} bytes")]
    HeaderTooLarge { max: usize },

    /// A header line was syntactically invalid.
    #[error("illegal header line: {reason}")]
    InvalidHeader { reason: String },

    /// The Content-Length header did not parse as a non-negative integer,
    /// or conflicted with Transfer-Encoding.
    #[error("malformed content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// A chunk size line was not valid hex, or chunk framing was broken.
    #[error("bad chunked transfer coding: {reason}")]
    MalformedChunk { reason: String },

    /// The request body exceeded `max_request_body_size`.
    #[error("request entity exceeds the limit of {max} bytes")]
    EntityTooLarge { max: usize },

    /// The client closed the stream before the declared body was complete.
    #[error("client disconnected with {remaining} body bytes outstanding")]
    ClientDisconnect { remaining: u64 },

    /// No bytes arrived within the per-request inactivity limit.
    #[error("request timed out")]
    RequestTimeout,

    /// CONNECT outside proxy mode, or a method the server refuses.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// An HTTP major version this server does not speak.
    #[error("http version {version} not supported")]
    VersionNotSupported { version: String },

    /// I/O failure while reading the request.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn invalid_request_line<S: ToString>(reason: S) -> Self {
        Self::InvalidRequestLine { reason: reason.to_string() }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn malformed_chunk<S: ToString>(reason: S) -> Self {
        Self::MalformedChunk { reason: reason.to_string() }
    }

    /// The HTTP status answered for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequestLine { .. }
            | Self::InvalidHeader { .. }
            | Self::InvalidContentLength { .. }
            | Self::MalformedChunk { .. } => StatusCode::BAD_REQUEST,
            Self::UriTooLong { .. } => StatusCode::URI_TOO_LONG,
            Self::HeaderTooLarge { .. } | Self::EntityTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::VersionNotSupported { .. } => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Self::ClientDisconnect { .. } | Self::Io { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether an in-band error response can still be attempted.
    ///
    /// A disconnected client cannot be answered; everything else gets the
    /// fixed error body.
    pub fn respondable(&self) -> bool {
        !matches!(self, Self::ClientDisconnect { .. } | Self::Io { .. })
    }
}

/// Errors raised by a TLS adapter while wrapping an accepted socket.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The client spoke plain HTTP to a TLS port. The server answers with
    /// a plain-text 400 and closes.
    #[error("client sent a plain HTTP request to a TLS port")]
    PlainHttp,

    /// A benign handshake failure (EOF before hello, unsupported version,
    /// proxy probe). Swallowed silently; the connection is closed.
    #[error("handshake aborted: {reason}")]
    Benign { reason: String },

    /// A handshake failure worth logging.
    #[error("tls handshake failed: {reason}")]
    Handshake { reason: String },

    /// Certificate or key material could not be loaded.
    #[error("tls configuration error: {reason}")]
    Config { reason: String },

    #[error("io error during handshake: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl TlsError {
    pub fn benign<S: ToString>(reason: S) -> Self {
        Self::Benign { reason: reason.to_string() }
    }

    pub fn handshake<S: ToString>(reason: S) -> Self {
        Self::Handshake { reason: reason.to_string() }
    }

    pub fn config<S: ToString>(reason: S) -> Self {
        Self::Config { reason: reason.to_string() }
    }
}

/// Peer-credential lookups that cannot be satisfied.
///
/// These never become HTTP errors; the gateway sees an internal condition.
#[derive(Debug, Error)]
pub enum PeerCredsError {
    #[error("peer credentials are only available on local sockets")]
    NotLocalSocket,

    #[error("peer credential lookup is disabled within this server")]
    Disabled,

    #[error("uid/gid name resolution is disabled within this server")]
    ResolveDisabled,

    #[error("peer credentials are unsupported on this platform")]
    Unsupported,

    #[error("peer credential lookup failed: {source}")]
    Lookup {
        #[from]
        source: io::Error,
    },
}

/// Whether an I/O error is part of normal connection teardown.
///
/// Mirrors the classic set of socket errors worth ignoring during close:
/// resets, broken pipes, timeouts of sockets already abandoned by the peer.
pub fn is_benign_socket_error(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | TimedOut | WouldBlock
    ) || matches!(err.raw_os_error(), Some(libc::EPIPE | libc::EBADF | libc::ENOTCONN))
}

/// Whether an I/O error is a read/write timeout.
///
/// Blocking sockets report timeouts as `WouldBlock` on most Unixes and
/// `TimedOut` on others; both mean the deadline elapsed.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_status_mapping() {
        assert_eq!(
            ParseError::invalid_request_line("nope").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ParseError::UriTooLong { max: 10 }.status(), StatusCode::URI_TOO_LONG);
        assert_eq!(
            ParseError::EntityTooLarge { max: 10 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ParseError::RequestTimeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            ParseError::VersionNotSupported { version: "HTTP/2.0".into() }.status(),
            StatusCode::HTTP_VERSION_NOT_SUPPORTED
        );
    }

    #[test]
    fn disconnects_are_not_respondable() {
        assert!(!ParseError::ClientDisconnect { remaining: 3 }.respondable());
        assert!(ParseError::malformed_chunk("xyz").respondable());
    }

    #[test]
    fn timeout_kinds() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
