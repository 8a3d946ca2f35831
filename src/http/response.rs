//! The response a gateway hands back to the engine.
//!
//! The body shape decides the wire framing: a [`ResponseBody::Full`] body
//! has a known length, so the engine supplies `Content-Length` when the
//! gateway didn't; a [`ResponseBody::Stream`] body has no known length and
//! is chunk-encoded on HTTP/1.1 (close-delimited on HTTP/1.0).

use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

/// Lazily produced response payload.
pub enum ResponseBody {
    Empty,
    /// Complete payload of known length.
    Full(Bytes),
    /// A lazy sequence of chunks; total length unknown up front.
    Stream(Box<dyn Iterator<Item = io::Result<Bytes>> + Send>),
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(bytes.into())
    }
}

impl From<&'static str> for ResponseBody {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        Self::Full(s.into_bytes().into())
    }
}

/// Status, headers and a lazy payload.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: ResponseBody::Empty }
    }

    /// `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<ResponseBody>) -> Self {
        Self::new(StatusCode::OK)
            .with_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .with_body(body)
    }

    /// `200 OK` with a chunk-producing body of unknown length.
    pub fn streaming<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Bytes>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(StatusCode::OK).with_body(ResponseBody::Stream(Box::new(chunks.into_iter())))
    }

    pub fn with_body(mut self, body: impl Into<ResponseBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
    {
        if let Ok(value) = value.try_into() {
            self.headers.append(name, value);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response_shape() {
        let resp = Response::text("hello");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers[http::header::CONTENT_TYPE], "text/plain; charset=utf-8");
        match resp.body {
            ResponseBody::Full(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("expected Full body, got {other:?}"),
        }
    }

    #[test]
    fn empty_detection() {
        assert!(ResponseBody::Empty.is_empty());
        assert!(ResponseBody::Full(Bytes::new()).is_empty());
        assert!(!ResponseBody::from("x").is_empty());
    }
}
