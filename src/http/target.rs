//! Request-target forms per RFC 7230 §5.3.
//!
//! Four shapes are possible on the wire: *origin-form* (`/path?q`),
//! *absolute-form* (`http://host/path`), *authority-form* (`host:port`,
//! CONNECT only) and *asterisk-form* (`*`, OPTIONS only). In non-proxy
//! mode an absolute-form target is still accepted (the path is used and
//! the authority preserved) while authority-form is answered with 405.

use http::{Method, Uri};

use crate::errors::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    Origin { path: String, query: Option<String> },
    Absolute { scheme: String, authority: String, path: String, query: Option<String> },
    Authority { authority: String },
    Asterisk,
}

impl RequestTarget {
    /// The path a router would dispatch on. Authority and asterisk forms
    /// have no path component.
    pub fn path(&self) -> &str {
        match self {
            Self::Origin { path, .. } | Self::Absolute { path, .. } => path,
            Self::Authority { .. } | Self::Asterisk => "",
        }
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Origin { query, .. } | Self::Absolute { query, .. } => query.as_deref(),
            Self::Authority { .. } | Self::Asterisk => None,
        }
    }

    pub fn authority(&self) -> Option<&str> {
        match self {
            Self::Absolute { authority, .. } | Self::Authority { authority } => Some(authority),
            Self::Origin { .. } | Self::Asterisk => None,
        }
    }
}

pub fn parse_target(
    raw: &str,
    method: &Method,
    proxy_mode: bool,
) -> Result<RequestTarget, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::invalid_request_line("empty request-target"));
    }
    if raw.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::invalid_request_line("control byte in request-target"));
    }
    if raw.contains('#') {
        return Err(ParseError::invalid_request_line("illegal #fragment in request-target"));
    }

    if raw == "*" {
        if method != Method::OPTIONS {
            return Err(ParseError::invalid_request_line(
                "asterisk-form target is only valid for OPTIONS",
            ));
        }
        return Ok(RequestTarget::Asterisk);
    }

    if raw.starts_with('/') {
        let (path, query) = split_query(raw);
        let path = decode_path(path)?;
        return Ok(RequestTarget::Origin { path, query: query.map(str::to_owned) });
    }

    if raw.contains("://") {
        if method == Method::CONNECT {
            return Err(ParseError::invalid_request_line(
                "CONNECT takes an authority-form target",
            ));
        }
        let uri: Uri = raw
            .parse()
            .map_err(|e| ParseError::invalid_request_line(format!("bad absolute-form URI: {e}")))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ParseError::invalid_request_line("absolute-form URI without scheme"))?
            .to_owned();
        let authority = uri
            .authority()
            .ok_or_else(|| {
                ParseError::invalid_request_line("absolute-form URI without authority")
            })?
            .as_str()
            .to_owned();
        let path = decode_path(if uri.path().is_empty() { "/" } else { uri.path() })?;
        return Ok(RequestTarget::Absolute {
            scheme,
            authority,
            path,
            query: uri.query().map(str::to_owned),
        });
    }

    // Authority form: host:port, valid only for CONNECT.
    if method != Method::CONNECT {
        return Err(ParseError::invalid_request_line(
            "request-target must be origin-form (start with '/')",
        ));
    }
    if !proxy_mode {
        return Err(ParseError::MethodNotAllowed);
    }
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| ParseError::invalid_request_line("authority-form target without port"))?;
    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::invalid_request_line(
            "authority-form target must be host:port",
        ));
    }
    Ok(RequestTarget::Authority { authority: raw.to_owned() })
}

fn split_query(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    }
}

/// Percent-decode a path, preserving encoded slashes.
///
/// `%2F` stays encoded so a decoded path cannot gain segment boundaries
/// the client never sent. A truncated or non-hex escape is a 400.
fn decode_path(path: &str) -> Result<String, ParseError> {
    if !path.contains('%') {
        return Ok(path.to_owned());
    }
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
            (Some(&hi), Some(&lo)) => (hi, lo),
            _ => {
                return Err(ParseError::invalid_request_line("truncated percent escape in path"))
            }
        };
        let value = (hex_value(hi).ok_or_else(bad_escape)? << 4) | hex_value(lo).ok_or_else(bad_escape)?;
        if value == b'/' {
            out.extend_from_slice(&bytes[i..i + 3]);
        } else {
            out.push(value);
        }
        i += 3;
    }
    String::from_utf8(out)
        .map_err(|_| ParseError::invalid_request_line("path decodes to invalid UTF-8"))
}

fn bad_escape() -> ParseError {
    ParseError::invalid_request_line("invalid percent escape in path")
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b + 10 - b'a'),
        b'A'..=b'F' => Some(b + 10 - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form() {
        let target = parse_target("/a/b?x=1&y=2", &Method::GET, false).unwrap();
        assert_eq!(target.path(), "/a/b");
        assert_eq!(target.query(), Some("x=1&y=2"));
        assert_eq!(target.authority(), None);
    }

    #[test]
    fn origin_form_decodes_escapes() {
        let target = parse_target("/a%20b", &Method::GET, false).unwrap();
        assert_eq!(target.path(), "/a b");
    }

    #[test]
    fn encoded_slash_is_preserved() {
        let target = parse_target("/a%2Fb", &Method::GET, false).unwrap();
        assert_eq!(target.path(), "/a%2Fb");
    }

    #[test]
    fn bad_escape_is_rejected() {
        assert!(parse_target("/a%zzb", &Method::GET, false).is_err());
        assert!(parse_target("/a%2", &Method::GET, false).is_err());
    }

    #[test]
    fn absolute_form_preserves_authority() {
        let target =
            parse_target("http://upstream.example:8080/x?q=1", &Method::GET, false).unwrap();
        assert_eq!(target.path(), "/x");
        assert_eq!(target.query(), Some("q=1"));
        assert_eq!(target.authority(), Some("upstream.example:8080"));
    }

    #[test]
    fn absolute_form_empty_path_becomes_root() {
        let target = parse_target("http://example.com", &Method::GET, false).unwrap();
        assert_eq!(target.path(), "/");
    }

    #[test]
    fn asterisk_requires_options() {
        assert!(parse_target("*", &Method::OPTIONS, false).is_ok());
        assert!(parse_target("*", &Method::GET, false).is_err());
    }

    #[test]
    fn connect_outside_proxy_mode_is_405() {
        let err = parse_target("example.com:443", &Method::CONNECT, false).unwrap_err();
        assert!(matches!(err, ParseError::MethodNotAllowed));
    }

    #[test]
    fn connect_in_proxy_mode() {
        let target = parse_target("example.com:443", &Method::CONNECT, true).unwrap();
        assert_eq!(target.authority(), Some("example.com:443"));
    }

    #[test]
    fn connect_without_port_is_rejected() {
        assert!(parse_target("example.com", &Method::CONNECT, true).is_err());
    }

    #[test]
    fn bare_word_target_is_rejected() {
        assert!(parse_target("favicon.ico", &Method::GET, false).is_err());
    }

    #[test]
    fn fragment_is_rejected() {
        assert!(parse_target("/page#top", &Method::GET, false).is_err());
    }
}
