//! One HTTP/1.x request/response exchange.
//!
//! [`Exchange`] owns the cycle: read and validate the request line through
//! the size-capped reader, read headers through the installed
//! [`HeaderReader`](crate::http::headers::HeaderReader), pick a body
//! framing, dispatch to the gateway, and write the response, chunk-framed
//! when the length is unknown on HTTP/1.1. Client-protocol errors are
//! answered in-band with a fixed error body and force the connection
//! closed; everything the state machine cannot answer propagates to the
//! connection for logging and teardown.

use std::io::{self, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::SystemTime;

use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode, Version};
use tracing::{debug, error, trace, warn};

use crate::conn::ConnMeta;
use crate::errors::{is_timeout, ParseError};
use crate::gateway::{Gateway, GatewayError};
use crate::http::headers::HeaderReader;
use crate::http::response::{Response, ResponseBody};
use crate::http::target::{parse_target, RequestTarget};
use crate::server::ServerConfig;
use crate::stream::body::{CappedLineReader, ChunkedReader, HeadLine, LengthReader};
use crate::stream::SocketStream;

/// Leftover request-body bytes drained after the gateway returns, to keep
/// the connection reusable. Anything larger forces a close instead.
const MAX_DRAIN: u64 = 64 * 1024;

/// The parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri_raw: String,
    pub target: RequestTarget,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Why a body read failed, remembered so the tail of the cycle can pick
/// the right status without re-reading a poisoned framing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFailure {
    TooLarge,
    Disconnect,
    Malformed,
    Timeout,
    Io,
}

impl BodyFailure {
    fn from_parse_error(err: &ParseError) -> Self {
        match err {
            ParseError::EntityTooLarge { .. } => Self::TooLarge,
            ParseError::ClientDisconnect { .. } => Self::Disconnect,
            ParseError::MalformedChunk { .. } => Self::Malformed,
            ParseError::Io { source } if is_timeout(source) => Self::Timeout,
            _ => Self::Io,
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Malformed => StatusCode::BAD_REQUEST,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Disconnect | Self::Io => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

enum BodyKind {
    None,
    Length(LengthReader),
    Chunked(ChunkedReader),
}

/// Request-body framing state, shared between the gateway's reads and the
/// post-gateway drain.
pub(crate) struct BodyState {
    kind: BodyKind,
    pub(crate) failure: Option<BodyFailure>,
}

impl BodyState {
    fn empty() -> Self {
        Self { kind: BodyKind::None, failure: None }
    }

    pub(crate) fn read(
        &mut self,
        stream: &mut SocketStream,
        buf: &mut [u8],
    ) -> Result<usize, ParseError> {
        if self.failure.is_some() {
            return Ok(0);
        }
        let result = match &mut self.kind {
            BodyKind::None => Ok(0),
            BodyKind::Length(reader) => reader.read(stream, buf),
            BodyKind::Chunked(reader) => reader.read(stream, buf),
        };
        if let Err(err) = &result {
            self.failure = Some(BodyFailure::from_parse_error(err));
        }
        result
    }

    fn is_done(&self) -> bool {
        match &self.kind {
            BodyKind::None => true,
            BodyKind::Length(reader) => reader.is_done(),
            BodyKind::Chunked(reader) => reader.is_done(),
        }
    }

    fn outstanding_hint(&self) -> u64 {
        match &self.kind {
            BodyKind::None => 0,
            BodyKind::Length(reader) => reader.remaining(),
            // A chunked body's remaining size is unknowable; assume small.
            BodyKind::Chunked(_) => 0,
        }
    }
}

/// The per-request view handed to the gateway.
pub struct Request<'a> {
    pub(crate) stream: &'a mut SocketStream,
    pub(crate) head: &'a RequestHead,
    pub(crate) body: &'a mut BodyState,
    pub(crate) meta: &'a ConnMeta,
    pub(crate) cfg: &'a ServerConfig,
    pub(crate) scheme: &'static str,
}

impl Request<'_> {
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The request-target exactly as it appeared on the wire.
    pub fn uri(&self) -> &str {
        &self.head.uri_raw
    }

    pub fn target(&self) -> &RequestTarget {
        &self.head.target
    }

    pub fn path(&self) -> &str {
        self.head.target.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.head.target.query()
    }

    pub fn authority(&self) -> Option<&str> {
        self.head.target.authority()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// `http` or `https`, decided by whether a TLS adapter wrapped the
    /// connection.
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    pub fn server_name(&self) -> &str {
        &self.cfg.server_name
    }

    pub fn remote_addr(&self) -> &crate::conn::RemoteAddr {
        &self.meta.remote_addr
    }

    /// TLS certificate environment captured at handshake, if any.
    pub fn tls_environ(&self) -> Option<&crate::tls::TlsEnv> {
        self.meta.tls_env.as_ref()
    }

    /// Peer-credential environment (`X_REMOTE_PID` and friends) for
    /// local-socket peers.
    pub fn peer_environ(
        &self,
    ) -> Result<std::collections::BTreeMap<String, String>, crate::errors::PeerCredsError> {
        self.meta.peer_environ()
    }

    /// Read request-body bytes. Returns zero at the end of the body.
    pub fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(self.stream, buf).map_err(io::Error::other)
    }

    /// Read the whole remaining body into memory.
    pub fn read_body_to_end(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = self.read_body(&mut buf)?;
            if n == 0 {
                return Ok(out.into());
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Read body bytes up to and including the next LF, or to the end of
    /// the body, whichever comes first. At most `max` bytes are returned;
    /// an empty result means the body is exhausted.
    pub fn read_body_line(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < max {
            if self.read_body(&mut byte)? == 0 {
                break;
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(line)
    }
}

impl Read for Request<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_body(buf)
    }
}

/// Outcome of one request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// The connection may be parked for another request.
    KeepAlive,
    /// The connection must be closed; any due response was written.
    Close,
    /// The stream ended cleanly with no request on it.
    StreamClosed,
}

/// Drives one request/response cycle over a connection's stream.
pub(crate) struct Exchange<'s> {
    stream: &'s mut SocketStream,
    cfg: &'s ServerConfig,
    scheme: &'static str,
    response_version: Version,
    status: StatusCode,
    pub(crate) started_request: bool,
    pub(crate) sent_headers: bool,
    /// An in-band error page was written; the close should linger so the
    /// client can read it even when request bytes were left unread.
    pub(crate) answered_error: bool,
    chunked_write: bool,
    close_connection: bool,
    request_method: Method,
    body: BodyState,
}

impl<'s> Exchange<'s> {
    pub fn new(stream: &'s mut SocketStream, cfg: &'s ServerConfig, tls: bool) -> Self {
        Self {
            stream,
            cfg,
            scheme: if tls { "https" } else { "http" },
            // Lowest-common response protocol until the request line is in.
            response_version: Version::HTTP_11,
            status: StatusCode::OK,
            started_request: false,
            sent_headers: false,
            answered_error: false,
            chunked_write: false,
            close_connection: false,
            request_method: Method::GET,
            body: BodyState::empty(),
        }
    }

    /// Run one full cycle. Protocol errors are answered in-band; `Err` is
    /// reserved for conditions with no client to answer.
    pub fn run(
        &mut self,
        meta: &ConnMeta,
        gateway: &dyn Gateway,
        header_reader: &dyn HeaderReader,
    ) -> Result<CycleOutcome, ParseError> {
        let head = match self.parse_request(header_reader) {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(CycleOutcome::StreamClosed),
            Err(err) => return self.answer_parse_error(err),
        };

        self.respond(head, meta, gateway)?;

        if self.close_connection {
            Ok(CycleOutcome::Close)
        } else {
            Ok(CycleOutcome::KeepAlive)
        }
    }

    fn answer_parse_error(&mut self, err: ParseError) -> Result<CycleOutcome, ParseError> {
        if let ParseError::Io { source } = &err {
            if is_timeout(source) {
                // Only a request already underway earns a 408; an idle
                // keep-alive connection that simply never spoke again is
                // closed without comment.
                if self.started_request {
                    self.simple_response(StatusCode::REQUEST_TIMEOUT, "Request Timeout")?;
                }
                return Ok(CycleOutcome::Close);
            }
        }
        if !err.respondable() {
            return Err(err);
        }
        debug!(error = %err, "rejecting malformed request");
        let msg = err.to_string();
        self.simple_response(err.status(), &msg)?;
        Ok(CycleOutcome::Close)
    }

    /// Parse the request line and header block. `Ok(None)` means the
    /// stream ended cleanly before a request began.
    fn parse_request(
        &mut self,
        header_reader: &dyn HeaderReader,
    ) -> Result<Option<RequestHead>, ParseError> {
        let mut lines = CappedLineReader::new(self.stream, self.cfg.max_request_header_size);

        let mut line = match lines.read_line().map_err(line_cap_to_uri_too_long)? {
            HeadLine::Line(line) => line,
            HeadLine::Eof => return Ok(None),
        };
        // Tolerate one empty line before the request line (RFC 7230 §3.5).
        if line.is_empty() {
            line = match lines.read_line().map_err(line_cap_to_uri_too_long)? {
                HeadLine::Line(line) => line,
                HeadLine::Eof => return Ok(None),
            };
        }

        self.started_request = true;
        let (method, uri_raw, version) = parse_request_line(&line)?;
        self.request_method = method.clone();
        self.response_version = match version {
            Version::HTTP_10 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let target = parse_target(&uri_raw, &method, self.cfg.proxy_mode)?;

        let mut headers = HeaderMap::new();
        header_reader.read_headers(&mut lines, &mut headers)?;

        self.close_connection = wants_close(version, &headers);
        self.body = self.select_body(&headers)?;

        trace!(
            method = %method,
            uri = %uri_raw,
            ?version,
            headers = headers.len(),
            "parsed request head"
        );

        Ok(Some(RequestHead { method, uri_raw, target, version, headers }))
    }

    /// Pick the request-body framing from the parsed headers.
    fn select_body(&self, headers: &HeaderMap) -> Result<BodyState, ParseError> {
        let te = headers.get(header::TRANSFER_ENCODING);
        let cl = headers.get(header::CONTENT_LENGTH);

        match (te, cl) {
            (Some(_), Some(_)) => {
                // Both present is the request-smuggling shape; refuse it.
                Err(ParseError::invalid_content_length(
                    "both Transfer-Encoding and Content-Length present",
                ))
            }
            (Some(te_value), None) => {
                if is_chunked(te_value) {
                    Ok(BodyState {
                        kind: BodyKind::Chunked(ChunkedReader::new(
                            self.cfg.max_request_body_size,
                        )),
                        failure: None,
                    })
                } else {
                    Err(ParseError::invalid_header(format!(
                        "unsupported transfer-encoding {:?}",
                        String::from_utf8_lossy(te_value.as_bytes())
                    )))
                }
            }
            (None, Some(_)) => {
                let length = parse_content_length(headers)?;
                let max = self.cfg.max_request_body_size;
                if max != 0 && length > max {
                    return Err(ParseError::EntityTooLarge { max: max as usize });
                }
                Ok(BodyState { kind: BodyKind::Length(LengthReader::new(length)), failure: None })
            }
            (None, None) => Ok(BodyState::empty()),
        }
    }

    fn respond(
        &mut self,
        head: RequestHead,
        meta: &ConnMeta,
        gateway: &dyn Gateway,
    ) -> Result<(), ParseError> {
        if expects_continue(&head.headers) {
            self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.stream.flush()?;
            debug!("sent 100 Continue");
        }

        let result = {
            let mut request = Request {
                stream: &mut *self.stream,
                head: &head,
                body: &mut self.body,
                meta,
                cfg: self.cfg,
                scheme: self.scheme,
            };
            catch_unwind(AssertUnwindSafe(|| gateway.handle(&mut request)))
        };

        match result {
            Err(panic) => {
                error!("gateway panicked: {}", panic_message(&panic));
                if !self.sent_headers {
                    self.simple_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    )?;
                }
                self.close_connection = true;
                Ok(())
            }
            Ok(Err(err)) => self.answer_gateway_error(err),
            Ok(Ok(response)) => {
                self.drain_request_body();
                self.write_response(response)
            }
        }
    }

    fn answer_gateway_error(&mut self, err: GatewayError) -> Result<(), ParseError> {
        // A gateway that failed because the request body failed gets the
        // body's status, not a blanket 500.
        let status = self
            .body
            .failure
            .map(BodyFailure::status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error!(error = %err, status = %status, "gateway error");
        if !self.sent_headers {
            let msg = if status == StatusCode::INTERNAL_SERVER_ERROR {
                "Internal Server Error".to_owned()
            } else {
                err.to_string()
            };
            self.simple_response(status, &msg)?;
        }
        self.close_connection = true;
        Ok(())
    }

    /// Consume body bytes the gateway left unread so the next request can
    /// be parsed off the stream. A large or failed remainder closes the
    /// connection instead.
    fn drain_request_body(&mut self) {
        if self.body.failure.is_some() {
            self.close_connection = true;
            return;
        }
        if self.body.is_done() {
            return;
        }
        if self.body.outstanding_hint() > MAX_DRAIN {
            self.close_connection = true;
            return;
        }
        let mut drained: u64 = 0;
        let mut buf = [0u8; 8 * 1024];
        loop {
            match self.body.read(self.stream, &mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    drained += n as u64;
                    if drained > MAX_DRAIN {
                        self.close_connection = true;
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "failed draining request body");
                    self.close_connection = true;
                    return;
                }
            }
        }
    }

    /// True when the status line allows a message body at all.
    fn status_allows_body(status: StatusCode) -> bool {
        !(status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED)
    }

    fn write_response(&mut self, response: Response) -> Result<(), ParseError> {
        self.status = response.status;
        let mut headers = response.headers;
        let body_allowed = Self::status_allows_body(response.status);
        let is_head = self.request_method == Method::HEAD;

        match response.body {
            ResponseBody::Empty => {
                if body_allowed && !headers.contains_key(header::CONTENT_LENGTH) {
                    headers.insert(header::CONTENT_LENGTH, http::HeaderValue::from_static("0"));
                }
                self.send_headers(&headers)?;
            }
            ResponseBody::Full(bytes) => {
                if !headers.contains_key(header::CONTENT_LENGTH) && body_allowed {
                    headers.insert(
                        header::CONTENT_LENGTH,
                        http::HeaderValue::from(bytes.len() as u64),
                    );
                }
                self.send_headers(&headers)?;
                if body_allowed && !is_head {
                    self.stream.write_all(&bytes)?;
                }
            }
            ResponseBody::Stream(chunks) => {
                let has_length = headers.contains_key(header::CONTENT_LENGTH);
                self.chunked_write = self.response_version >= Version::HTTP_11
                    && !has_length
                    && body_allowed;
                if self.chunked_write {
                    headers.insert(
                        header::TRANSFER_ENCODING,
                        http::HeaderValue::from_static("chunked"),
                    );
                } else if !has_length {
                    // No framing available: the body ends when the
                    // connection does.
                    self.close_connection = true;
                }
                self.send_headers(&headers)?;
                if body_allowed && !is_head {
                    self.write_stream_body(chunks)?;
                }
            }
        }

        self.stream.flush()?;
        Ok(())
    }

    fn write_stream_body(
        &mut self,
        chunks: Box<dyn Iterator<Item = io::Result<Bytes>> + Send>,
    ) -> Result<(), ParseError> {
        for chunk in chunks {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    // Headers are out; nothing left but to cut the stream
                    // so the client sees a broken body, not a short one.
                    warn!(error = %err, "response body iterator failed");
                    self.close_connection = true;
                    return Err(ParseError::Io { source: err });
                }
            };
            if chunk.is_empty() {
                continue;
            }
            self.write_body_chunk(&chunk)?;
        }
        if self.chunked_write {
            self.stream.write_all(b"0\r\n\r\n")?;
        }
        Ok(())
    }

    /// Write one body chunk, framed when chunked-write is on.
    fn write_body_chunk(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        debug_assert!(self.sent_headers);
        if self.chunked_write {
            let head = format!("{:X}\r\n", chunk.len());
            self.stream.write_all(head.as_bytes())?;
            self.stream.write_all(chunk)?;
            self.stream.write_all(b"\r\n")?;
        } else {
            self.stream.write_all(chunk)?;
        }
        Ok(())
    }

    /// Assemble and write the status line and headers in one pass.
    ///
    /// `Server` and `Date` are supplied when missing; the connection
    /// headers reflect the keep-alive decision made for this cycle.
    fn send_headers(&mut self, headers: &HeaderMap) -> Result<(), ParseError> {
        debug_assert!(!self.sent_headers, "headers already sent");

        let version = match self.response_version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let reason = self.status.canonical_reason().unwrap_or("");
        let mut head = format!("{} {} {}\r\n", version, self.status.as_u16(), reason);

        for (name, value) in headers {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value.as_bytes()));
            head.push_str("\r\n");
        }

        if !headers.contains_key(header::SERVER) {
            head.push_str("server: ");
            head.push_str(&self.cfg.server_name);
            head.push_str("\r\n");
        }
        if !headers.contains_key(header::DATE) {
            head.push_str("date: ");
            head.push_str(&httpdate::fmt_http_date(SystemTime::now()));
            head.push_str("\r\n");
        }

        if self.close_connection {
            if !headers.contains_key(header::CONNECTION) {
                head.push_str("connection: close\r\n");
            }
        } else {
            // Advertise the idle deadline so clients can avoid reusing a
            // connection the server is about to expire (the FIN race).
            let timeout = self.cfg.timeout.as_secs().max(1);
            if self.response_version == Version::HTTP_10 {
                head.push_str("connection: keep-alive\r\n");
            }
            head.push_str(&format!("keep-alive: timeout={timeout}\r\n"));
        }

        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes())?;
        self.stream.flush()?;
        self.sent_headers = true;
        Ok(())
    }

    /// Write a fixed-format error page and mark the connection for close.
    ///
    /// Safe to call at any point before headers have gone out; afterwards
    /// it only flags the close.
    pub(crate) fn simple_response(
        &mut self,
        status: StatusCode,
        msg: &str,
    ) -> Result<(), ParseError> {
        self.close_connection = true;
        if self.sent_headers {
            return Ok(());
        }
        self.answered_error = true;
        self.status = status;
        let code = status.as_u16();
        let reason = status.canonical_reason().unwrap_or("");
        let body = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{code} {reason}</title></head>\n\
             <body>\n<h1>{code} {reason}</h1>\n<p>{msg}</p>\n</body>\n</html>\n",
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, http::HeaderValue::from(body.len() as u64));
        self.send_headers(&headers)?;
        if self.request_method != Method::HEAD {
            self.stream.write_all(body.as_bytes())?;
        }
        self.stream.flush()?;
        Ok(())
    }
}

fn line_cap_to_uri_too_long(err: ParseError) -> ParseError {
    match err {
        ParseError::HeaderTooLarge { max } => ParseError::UriTooLong { max },
        other => other,
    }
}

/// Split and validate `METHOD SP request-target SP HTTP-version`.
fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::invalid_request_line("request line is not ASCII"))?;

    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ParseError::invalid_request_line("leading whitespace"));
    }

    let mut parts = line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() && !v.is_empty() => {
            (m, t, v)
        }
        _ => {
            return Err(ParseError::invalid_request_line(
                "expected 'METHOD SP request-target SP HTTP-version'",
            ))
        }
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ParseError::invalid_request_line(format!("invalid method {method:?}")))?;

    let version = parse_http_version(version)?;

    Ok((method, target.to_owned(), version))
}

fn parse_http_version(version: &str) -> Result<Version, ParseError> {
    let digits = version
        .strip_prefix("HTTP/")
        .ok_or_else(|| ParseError::invalid_request_line("missing HTTP-version"))?;
    let bytes = digits.as_bytes();
    match bytes {
        [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
            match (major, minor) {
                (b'1', b'0') => Ok(Version::HTTP_10),
                (b'1', b'1') => Ok(Version::HTTP_11),
                _ => Err(ParseError::VersionNotSupported { version: version.to_owned() }),
            }
        }
        // A major-only version ("HTTP/1") is malformed, not unsupported.
        _ => Err(ParseError::invalid_request_line(format!("bad HTTP-version {version:?}"))),
    }
}

/// Keep-alive decision from the request side alone.
fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let tokens: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();
    match version {
        Version::HTTP_10 => !tokens.iter().any(|t| t == "keep-alive"),
        _ => tokens.iter().any(|t| t == "close"),
    }
}

/// Chunked framing applies when `chunked` is the final transfer coding.
fn is_chunked(value: &http::HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

/// A single Content-Length value as a non-negative integer; repeated
/// identical values are tolerated, anything else is malformed.
fn parse_content_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    let mut parsed: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let text = value
            .to_str()
            .map_err(|_| ParseError::invalid_content_length("value is not ASCII"))?
            .trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::invalid_content_length(format!("bad value {text:?}")));
        }
        let value: u64 = text
            .parse()
            .map_err(|_| ParseError::invalid_content_length(format!("bad value {text:?}")))?;
        match parsed {
            None => parsed = Some(value),
            Some(prev) if prev == value => {}
            Some(_) => {
                return Err(ParseError::invalid_content_length("conflicting duplicate values"))
            }
        }
    }
    parsed.ok_or_else(|| ParseError::invalid_content_length("missing value"))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnMeta, RemoteAddr};
    use crate::http::headers::DefaultHeaderReader;
    use crate::stream::testing::stream_over;

    struct Echo;

    impl Gateway for Echo {
        fn handle(&self, req: &mut Request<'_>) -> Result<Response, GatewayError> {
            let body = req.read_body_to_end()?;
            Ok(Response::text(String::from_utf8_lossy(&body).into_owned()))
        }
    }

    struct Hello;

    impl Gateway for Hello {
        fn handle(&self, _req: &mut Request<'_>) -> Result<Response, GatewayError> {
            Ok(Response::text("hello"))
        }
    }

    struct Streamer;

    impl Gateway for Streamer {
        fn handle(&self, _req: &mut Request<'_>) -> Result<Response, GatewayError> {
            let chunks = vec![Ok(Bytes::from_static(b"alpha")), Ok(Bytes::from_static(b"beta"))];
            Ok(Response::streaming(chunks))
        }
    }

    struct Panics;

    impl Gateway for Panics {
        fn handle(&self, _req: &mut Request<'_>) -> Result<Response, GatewayError> {
            panic!("boom");
        }
    }

    fn run_one(
        input: &[u8],
        gateway: &dyn Gateway,
        cfg: &ServerConfig,
    ) -> (CycleOutcome, Vec<u8>) {
        let (mut stream, output) = stream_over(input);
        let meta = ConnMeta::for_tests(RemoteAddr::Unknown);
        let outcome = {
            let mut exchange = Exchange::new(&mut stream, cfg, false);
            exchange.run(&meta, gateway, &DefaultHeaderReader).unwrap()
        };
        let wire = output.lock().unwrap().clone();
        (outcome, wire)
    }

    fn wire_str(wire: &[u8]) -> String {
        String::from_utf8_lossy(wire).into_owned()
    }

    #[test]
    fn plain_get_keeps_alive() {
        let cfg = ServerConfig::default();
        let (outcome, wire) =
            run_one(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        let text = wire_str(&wire);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.contains("keep-alive: timeout="), "{text}");
        assert!(text.ends_with("\r\n\r\nhello"), "{text}");
    }

    #[test]
    fn http10_without_keepalive_closes() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(b"GET / HTTP/1.0\r\n\r\n", &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::Close);
        let text = wire_str(&wire);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
    }

    #[test]
    fn http10_with_keepalive_stays_open() {
        let cfg = ServerConfig::default();
        let (outcome, wire) =
            run_one(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        let text = wire_str(&wire);
        assert!(text.contains("connection: keep-alive\r\n"), "{text}");
        assert!(text.contains("keep-alive: timeout="), "{text}");
    }

    #[test]
    fn chunked_request_body_reaches_gateway() {
        let cfg = ServerConfig::default();
        let input = b"POST /x HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n0\r\n\r\n";
        let (outcome, wire) = run_one(input, &Echo, &cfg);
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        assert!(wire_str(&wire).ends_with("hello"));
    }

    #[test]
    fn streamed_response_is_chunk_framed() {
        let cfg = ServerConfig::default();
        let (outcome, wire) =
            run_one(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &Streamer, &cfg);
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        let text = wire_str(&wire);
        assert!(text.contains("transfer-encoding: chunked\r\n"), "{text}");
        assert!(text.ends_with("5\r\nalpha\r\n4\r\nbeta\r\n0\r\n\r\n"), "{text}");
    }

    #[test]
    fn streamed_response_on_http10_closes() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(
            b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n",
            &Streamer,
            &cfg,
        );
        assert_eq!(outcome, CycleOutcome::Close);
        let text = wire_str(&wire);
        assert!(!text.contains("transfer-encoding"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
        assert!(text.ends_with("alphabeta"), "{text}");
    }

    #[test]
    fn bad_request_line_is_400_and_close() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(b"GET /\r\n\r\n", &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::Close);
        let text = wire_str(&wire);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
    }

    #[test]
    fn major_only_version_is_400() {
        let cfg = ServerConfig::default();
        let (_, wire) = run_one(b"GET / HTTP/1\r\n\r\n", &Hello, &cfg);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn unsupported_major_is_505() {
        let cfg = ServerConfig::default();
        let (_, wire) = run_one(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", &Hello, &cfg);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 505"));
    }

    #[test]
    fn oversize_request_line_is_414() {
        let cfg = ServerConfig { max_request_header_size: 64, ..ServerConfig::default() };
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(100));
        let (outcome, wire) = run_one(long.as_bytes(), &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::Close);
        let text = wire_str(&wire);
        assert!(text.starts_with("HTTP/1.1 414"), "{text}");
        assert!(text.contains("connection: close\r\n"), "{text}");
    }

    #[test]
    fn oversize_header_block_is_413() {
        let cfg = ServerConfig { max_request_header_size: 48, ..ServerConfig::default() };
        let input = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n\r\n", "b".repeat(100));
        let (_, wire) = run_one(input.as_bytes(), &Hello, &cfg);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 413"));
    }

    #[test]
    fn oversize_declared_body_is_413() {
        let cfg = ServerConfig { max_request_body_size: 4, ..ServerConfig::default() };
        let (_, wire) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n0123456789",
            &Echo,
            &cfg,
        );
        assert!(wire_str(&wire).starts_with("HTTP/1.1 413"));
    }

    #[test]
    fn body_at_exact_limit_succeeds() {
        let cfg = ServerConfig { max_request_body_size: 5, ..ServerConfig::default() };
        let (_, wire) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
            &Echo,
            &cfg,
        );
        assert!(wire_str(&wire).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn content_length_zero_is_accepted() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n",
            &Echo,
            &cfg,
        );
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn conflicting_framing_headers_are_400() {
        let cfg = ServerConfig::default();
        let (_, wire) = run_one(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
            &Echo,
            &cfg,
        );
        assert!(wire_str(&wire).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn negative_content_length_is_400() {
        let cfg = ServerConfig::default();
        let (_, wire) = run_one(
            b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n",
            &Echo,
            &cfg,
        );
        assert!(wire_str(&wire).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn truncated_body_fails_the_gateway_read() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nshort",
            &Echo,
            &cfg,
        );
        assert_eq!(outcome, CycleOutcome::Close);
        // The client disconnected mid-body, so a 500 is a best effort.
        assert!(wire_str(&wire).starts_with("HTTP/1.1 500"));
    }

    #[test]
    fn gateway_panic_becomes_500() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &Panics, &cfg);
        assert_eq!(outcome, CycleOutcome::Close);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 500"));
    }

    #[test]
    fn expect_continue_is_answered() {
        let cfg = ServerConfig::default();
        let input = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\
                      Expect: 100-continue\r\n\r\nhello";
        let (_, wire) = run_one(input, &Echo, &cfg);
        let text = wire_str(&wire);
        assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200"), "{text}");
    }

    #[test]
    fn head_omits_the_body() {
        let cfg = ServerConfig::default();
        let (_, wire) = run_one(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", &Hello, &cfg);
        let text = wire_str(&wire);
        assert!(text.contains("content-length: 5\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"), "{text}");
    }

    #[test]
    fn empty_stream_is_clean_close() {
        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(b"", &Hello, &cfg);
        assert_eq!(outcome, CycleOutcome::StreamClosed);
        assert!(wire.is_empty());
    }

    #[test]
    fn body_lines_are_readable() {
        struct Lines;

        impl Gateway for Lines {
            fn handle(&self, req: &mut Request<'_>) -> Result<Response, GatewayError> {
                assert_eq!(req.read_body_line(64)?, b"alpha\n");
                assert_eq!(req.read_body_line(64)?, b"beta");
                assert_eq!(req.read_body_line(64)?, b"");
                Ok(Response::text("ok"))
            }
        }

        let cfg = ServerConfig::default();
        let (outcome, wire) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nalpha\nbeta",
            &Lines,
            &cfg,
        );
        assert_eq!(outcome, CycleOutcome::KeepAlive);
        assert!(wire_str(&wire).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn unconsumed_body_is_drained_for_reuse() {
        let cfg = ServerConfig::default();
        let (outcome, _) = run_one(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
            &Hello,
            &cfg,
        );
        assert_eq!(outcome, CycleOutcome::KeepAlive);
    }
}
