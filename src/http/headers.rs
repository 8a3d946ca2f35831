//! Header-block reading strategies.
//!
//! A [`HeaderReader`] consumes header lines until the empty line that ends
//! the request head. Obsolete line folding is collapsed into the previous
//! field with a single space; duplicate fields are comma-joined when the
//! field is on the RFC comma-separated list, and kept as separate entries
//! otherwise (the `Set-Cookie` class).
//!
//! The strategy is a value, not a subclass: the server installs one reader
//! per request cycle. [`DropUnderscoreHeaderReader`] silently discards any
//! field whose name contains an underscore, closing the ambiguity with
//! environments that normalize `-` and `_` to the same key.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::errors::ParseError;
use crate::stream::body::{CappedLineReader, HeadLine};

/// Fields whose duplicates may be joined with `", "` per RFC 7230 §3.2.2.
const COMMA_SEPARATED: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "accept-ranges",
    "allow",
    "cache-control",
    "connection",
    "content-encoding",
    "content-language",
    "expect",
    "if-match",
    "if-none-match",
    "pragma",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "vary",
    "via",
    "warning",
    "www-authenticate",
];

fn is_comma_separated(name: &HeaderName) -> bool {
    COMMA_SEPARATED.contains(&name.as_str())
}

/// Reads the header block of one request.
pub trait HeaderReader: Send + Sync {
    fn read_headers(
        &self,
        lines: &mut CappedLineReader<'_>,
        headers: &mut HeaderMap,
    ) -> Result<(), ParseError>;
}

/// Accepts every syntactically valid field.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHeaderReader;

impl HeaderReader for DefaultHeaderReader {
    fn read_headers(
        &self,
        lines: &mut CappedLineReader<'_>,
        headers: &mut HeaderMap,
    ) -> Result<(), ParseError> {
        read_header_block(lines, headers, |_| true)
    }
}

/// Discards any field whose name contains `_`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropUnderscoreHeaderReader;

impl HeaderReader for DropUnderscoreHeaderReader {
    fn read_headers(
        &self,
        lines: &mut CappedLineReader<'_>,
        headers: &mut HeaderMap,
    ) -> Result<(), ParseError> {
        read_header_block(lines, headers, |name| !name.contains('_'))
    }
}

fn read_header_block(
    lines: &mut CappedLineReader<'_>,
    headers: &mut HeaderMap,
    keep: impl Fn(&str) -> bool,
) -> Result<(), ParseError> {
    // The field currently being assembled; committed when the next
    // non-continuation line arrives.
    let mut pending: Option<(String, Vec<u8>)> = None;

    loop {
        let line = match lines.read_line()? {
            HeadLine::Line(line) => line,
            HeadLine::Eof => {
                return Err(ParseError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended inside the header block",
                    ),
                })
            }
        };

        if line.is_empty() {
            commit(headers, pending.take(), &keep)?;
            return Ok(());
        }

        if line[0] == b' ' || line[0] == b'\t' {
            // obs-fold: the line continues the previous field value.
            let Some((_, value)) = pending.as_mut() else {
                return Err(ParseError::invalid_header(
                    "continuation line without a preceding header field",
                ));
            };
            value.push(b' ');
            value.extend_from_slice(trim_ows(&line));
            continue;
        }

        commit(headers, pending.take(), &keep)?;

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ParseError::invalid_header("header line has no colon"))?;
        let (name, rest) = line.split_at(colon);
        if name.is_empty() {
            return Err(ParseError::invalid_header("header line has an empty name"));
        }
        if name.iter().any(|&b| b == b' ' || b == b'\t') {
            // Whitespace between field name and colon enables response
            // splitting; reject outright.
            return Err(ParseError::invalid_header("whitespace before colon"));
        }
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| ParseError::invalid_header("header name is not ASCII"))?;
        let value = trim_ows(&rest[1..]).to_vec();
        pending = Some((name, value));
    }
}

fn commit(
    headers: &mut HeaderMap,
    pending: Option<(String, Vec<u8>)>,
    keep: &impl Fn(&str) -> bool,
) -> Result<(), ParseError> {
    let Some((name, value)) = pending else {
        return Ok(());
    };
    if !keep(&name) {
        tracing::debug!(header = %name, "dropping header by reader policy");
        return Ok(());
    }
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ParseError::invalid_header(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_bytes(&value)
        .map_err(|_| ParseError::invalid_header(format!("invalid value for {name}")))?;

    if is_comma_separated(&name) {
        if let Some(existing) = headers.get(&name) {
            let mut joined = existing.as_bytes().to_vec();
            joined.extend_from_slice(b", ");
            joined.extend_from_slice(value.as_bytes());
            let joined = HeaderValue::from_bytes(&joined)
                .map_err(|_| ParseError::invalid_header(format!("invalid value for {name}")))?;
            headers.insert(name, joined);
            return Ok(());
        }
    }
    headers.append(name, value);
    Ok(())
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::stream_over;
    use http::header;

    fn read_with(reader: &dyn HeaderReader, input: &[u8]) -> Result<HeaderMap, ParseError> {
        let (mut stream, _) = stream_over(input);
        let mut lines = CappedLineReader::new(&mut stream, 0);
        let mut headers = HeaderMap::new();
        reader.read_headers(&mut lines, &mut headers)?;
        Ok(headers)
    }

    #[test]
    fn plain_fields() {
        let headers = read_with(
            &DefaultHeaderReader,
            b"Host: example.com\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[header::HOST], "example.com");
        assert_eq!(headers[header::ACCEPT], "*/*");
    }

    #[test]
    fn obs_fold_is_collapsed() {
        let headers = read_with(
            &DefaultHeaderReader,
            b"X-Long: first part\r\n  second part\r\nHost: x\r\n\r\n",
        )
        .unwrap();
        assert_eq!(headers["x-long"], "first part second part");
        assert_eq!(headers[header::HOST], "x");
    }

    #[test]
    fn comma_separated_duplicates_are_joined() {
        let headers = read_with(
            &DefaultHeaderReader,
            b"Accept: text/html\r\nAccept: application/json\r\n\r\n",
        )
        .unwrap();
        assert_eq!(headers[header::ACCEPT], "text/html, application/json");
        assert_eq!(headers.get_all(header::ACCEPT).iter().count(), 1);
    }

    #[test]
    fn cookie_class_duplicates_stay_separate() {
        let headers =
            read_with(&DefaultHeaderReader, b"Cookie: a=1\r\nCookie: b=2\r\n\r\n").unwrap();
        let values: Vec<_> = headers.get_all(header::COOKIE).iter().collect();
        assert_eq!(values, ["a=1", "b=2"]);
    }

    #[test]
    fn underscores_kept_by_default() {
        let headers =
            read_with(&DefaultHeaderReader, b"X_Forwarded_For: 1.2.3.4\r\n\r\n").unwrap();
        assert_eq!(headers["x_forwarded_for"], "1.2.3.4");
    }

    #[test]
    fn underscores_dropped_when_installed() {
        let headers = read_with(
            &DropUnderscoreHeaderReader,
            b"X_Forwarded_For: 1.2.3.4\r\nHost: x\r\n\r\n",
        )
        .unwrap();
        assert!(headers.get("x_forwarded_for").is_none());
        assert_eq!(headers[header::HOST], "x");
    }

    #[test]
    fn missing_colon_is_rejected() {
        let err = read_with(&DefaultHeaderReader, b"not a header line\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[test]
    fn space_before_colon_is_rejected() {
        let err = read_with(&DefaultHeaderReader, b"Host : x\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[test]
    fn continuation_without_field_is_rejected() {
        let err = read_with(&DefaultHeaderReader, b"  dangling\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[test]
    fn eof_mid_block_is_io_error() {
        let err = read_with(&DefaultHeaderReader, b"Host: x\r\n").unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }
}
