//! Framed readers over the buffered socket stream.
//!
//! Three framings cover every HTTP/1.x request:
//!
//! - [`CappedLineReader`]: line reads for the request head, failing once a
//!   cumulative byte budget is spent.
//! - [`LengthReader`]: a body of declared `Content-Length`; end of stream
//!   before the declared length is a client disconnect, never a short
//!   success.
//! - [`ChunkedReader`]: `Transfer-Encoding: chunked` per RFC 7230 §4.1:
//!   hex size lines, discarded chunk extensions, CRLF framing checks, and
//!   trailer consumption after the zero chunk.

use crate::errors::ParseError;
use crate::stream::SocketStream;

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Budget for trailer lines after the zero chunk.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// One line of the request head, or the end of the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum HeadLine {
    /// A complete line with its terminator stripped.
    Line(Vec<u8>),
    /// The stream ended cleanly before any byte of a line arrived.
    Eof,
}

/// Line reader for the request head with a cumulative size cap.
///
/// The cap spans the request line and every header line together, so a
/// pathological client cannot stretch the head one line at a time.
pub struct CappedLineReader<'a> {
    stream: &'a mut SocketStream,
    remaining: usize,
    max: usize,
}

impl<'a> CappedLineReader<'a> {
    /// `max == 0` disables the cap.
    pub fn new(stream: &'a mut SocketStream, max: usize) -> Self {
        let effective = if max == 0 { usize::MAX } else { max };
        Self { stream, remaining: effective, max }
    }

    /// Read the next head line, terminator stripped.
    ///
    /// `CRLF` and bare `LF` terminators are both accepted. A stream that
    /// ends mid-line is reported as an I/O error; spending the budget
    /// fails with [`ParseError::HeaderTooLarge`] (the caller maps the
    /// first line to 414).
    pub fn read_line(&mut self) -> Result<HeadLine, ParseError> {
        let mut raw = Vec::new();
        let (n, complete) = self.stream.read_line(&mut raw, self.remaining)?;
        if !complete {
            self.remaining = 0;
            return Err(ParseError::HeaderTooLarge { max: self.max });
        }
        self.remaining -= n;
        if n == 0 {
            return Ok(HeadLine::Eof);
        }
        if raw.last() != Some(&b'\n') {
            return Err(ParseError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a header line",
                ),
            });
        }
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(HeadLine::Line(raw))
    }
}

/// Body reader for a declared `Content-Length`.
///
/// Reads return at most the outstanding remainder; once it reaches zero
/// every further read is a clean EOF. A transport EOF with bytes still
/// outstanding fails with [`ParseError::ClientDisconnect`] so the gateway
/// can never mistake a truncated body for a complete one.
#[derive(Debug)]
pub struct LengthReader {
    remaining: u64,
}

impl LengthReader {
    pub fn new(content_length: u64) -> Self {
        Self { remaining: content_length }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    pub fn read(&mut self, stream: &mut SocketStream, buf: &mut [u8]) -> Result<usize, ParseError> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = std::io::Read::read(stream, &mut buf[..want])?;
        if n == 0 {
            return Err(ParseError::ClientDisconnect { remaining: self.remaining });
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Before a size line.
    Size,
    /// Inside chunk data with bytes outstanding.
    Data,
    /// Between the end of chunk data and its trailing CRLF.
    DataCrlf,
    /// After the zero chunk, consuming trailer lines.
    Trailers,
    /// Message complete.
    Done,
}

/// Body reader for `Transfer-Encoding: chunked`.
///
/// Size lines are hex up to an optional `;`-prefixed extension, which is
/// discarded. Every chunk must be followed by CRLF. The zero chunk ends
/// the body, after which trailer lines are consumed until an empty line.
/// Total body bytes, framing included, are bounded by `maxlen`.
pub struct ChunkedReader {
    state: ChunkState,
    chunk_remaining: u64,
    bytes_read: u64,
    maxlen: u64,
}

impl ChunkedReader {
    /// `maxlen == 0` disables the body cap.
    pub fn new(maxlen: u64) -> Self {
        Self { state: ChunkState::Size, chunk_remaining: 0, bytes_read: 0, maxlen }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn charge(&mut self, n: u64) -> Result<(), ParseError> {
        self.bytes_read += n;
        if self.maxlen != 0 && self.bytes_read > self.maxlen {
            return Err(ParseError::EntityTooLarge { max: self.maxlen as usize });
        }
        Ok(())
    }

    fn read_framing_line(
        &mut self,
        stream: &mut SocketStream,
        limit: usize,
    ) -> Result<Vec<u8>, ParseError> {
        let mut raw = Vec::new();
        let (n, complete) = stream.read_line(&mut raw, limit)?;
        if !complete {
            return Err(ParseError::malformed_chunk("framing line too long"));
        }
        if n == 0 || raw.last() != Some(&b'\n') {
            return Err(ParseError::ClientDisconnect { remaining: 0 });
        }
        self.charge(n as u64)?;
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Ok(raw)
    }

    fn next_chunk(&mut self, stream: &mut SocketStream) -> Result<(), ParseError> {
        let line = self.read_framing_line(stream, MAX_CHUNK_SIZE_LINE)?;
        // Chunk extensions end at the first semicolon and are ignored.
        let size_field = match line.iter().position(|&b| b == b';') {
            Some(pos) => &line[..pos],
            None => &line[..],
        };
        let size_field = trim_ascii(size_field);
        if size_field.is_empty() {
            return Err(ParseError::malformed_chunk("empty chunk size line"));
        }
        let mut size: u64 = 0;
        for &b in size_field {
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b + 10 - b'a',
                b'A'..=b'F' => b + 10 - b'A',
                _ => {
                    return Err(ParseError::malformed_chunk(format!(
                        "invalid hex digit {:?} in chunk size",
                        b as char
                    )))
                }
            };
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(u64::from(digit)))
                .ok_or_else(|| ParseError::malformed_chunk("chunk size overflow"))?;
        }
        if size == 0 {
            self.state = ChunkState::Trailers;
            return Ok(());
        }
        if self.maxlen != 0 && self.bytes_read + size > self.maxlen {
            return Err(ParseError::EntityTooLarge { max: self.maxlen as usize });
        }
        self.chunk_remaining = size;
        self.state = ChunkState::Data;
        Ok(())
    }

    fn finish_chunk(&mut self, stream: &mut SocketStream) -> Result<(), ParseError> {
        let mut crlf = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            let n = std::io::Read::read(stream, &mut crlf[got..])?;
            if n == 0 {
                return Err(ParseError::ClientDisconnect { remaining: 0 });
            }
            got += n;
        }
        self.charge(2)?;
        if crlf != *b"\r\n" {
            return Err(ParseError::malformed_chunk(format!(
                "expected CRLF after chunk data, got {:?}",
                crlf
            )));
        }
        self.state = ChunkState::Size;
        Ok(())
    }

    fn read_trailers(&mut self, stream: &mut SocketStream) -> Result<(), ParseError> {
        loop {
            let line = self.read_framing_line(stream, MAX_TRAILER_BYTES)?;
            if line.is_empty() {
                self.state = ChunkState::Done;
                return Ok(());
            }
            // Trailer fields are consumed and thrown away.
        }
    }

    pub fn read(&mut self, stream: &mut SocketStream, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => self.next_chunk(stream)?,
                ChunkState::Trailers => {
                    self.read_trailers(stream)?;
                    return Ok(0);
                }
                ChunkState::DataCrlf => self.finish_chunk(stream)?,
                ChunkState::Data => {
                    let want = buf.len().min(self.chunk_remaining.min(usize::MAX as u64) as usize);
                    let n = std::io::Read::read(stream, &mut buf[..want])?;
                    if n == 0 {
                        return Err(ParseError::ClientDisconnect {
                            remaining: self.chunk_remaining,
                        });
                    }
                    self.charge(n as u64)?;
                    self.chunk_remaining -= n as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ChunkState::DataCrlf;
                    }
                    return Ok(n);
                }
            }
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
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

    fn drain_chunked(reader: &mut ChunkedReader, stream: &mut SocketStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let n = reader.read(stream, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn capped_reader_strips_terminators() {
        let (mut stream, _) = stream_over(b"Host: x\r\nAccept: */*\n\r\n");
        let mut lines = CappedLineReader::new(&mut stream, 1024);
        assert_eq!(lines.read_line().unwrap(), HeadLine::Line(b"Host: x".to_vec()));
        assert_eq!(lines.read_line().unwrap(), HeadLine::Line(b"Accept: */*".to_vec()));
        assert_eq!(lines.read_line().unwrap(), HeadLine::Line(Vec::new()));
        assert_eq!(lines.read_line().unwrap(), HeadLine::Eof);
    }

    #[test]
    fn capped_reader_budget_spans_lines() {
        let (mut stream, _) = stream_over(b"aaaa\r\nbbbb\r\ncccc\r\n");
        let mut lines = CappedLineReader::new(&mut stream, 13);
        assert!(lines.read_line().is_ok());
        assert!(lines.read_line().is_ok());
        match lines.read_line() {
            Err(ParseError::HeaderTooLarge { max }) => assert_eq!(max, 13),
            other => panic!("expected HeaderTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn capped_reader_exact_fit_succeeds() {
        let (mut stream, _) = stream_over(b"abcd\r\n");
        let mut lines = CappedLineReader::new(&mut stream, 6);
        assert_eq!(lines.read_line().unwrap(), HeadLine::Line(b"abcd".to_vec()));
    }

    #[test]
    fn length_reader_caps_at_declared_length() {
        let (mut stream, _) = stream_over(b"hello world");
        let mut body = LengthReader::new(5);
        let mut buf = [0u8; 16];
        assert_eq!(body.read(&mut stream, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(body.read(&mut stream, &mut buf).unwrap(), 0);
        assert!(body.is_done());
    }

    #[test]
    fn length_reader_short_stream_is_disconnect() {
        let (mut stream, _) = stream_over(b"hel");
        let mut body = LengthReader::new(5);
        let mut buf = [0u8; 16];
        assert_eq!(body.read(&mut stream, &mut buf).unwrap(), 3);
        match body.read(&mut stream, &mut buf) {
            Err(ParseError::ClientDisconnect { remaining }) => assert_eq!(remaining, 2),
            other => panic!("expected ClientDisconnect, got {other:?}"),
        }
    }

    #[test]
    fn chunked_basic() {
        let (mut stream, _) = stream_over(b"5\r\nhello\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new(0);
        assert_eq!(drain_chunked(&mut reader, &mut stream), b"hello");
        assert!(reader.is_done());
    }

    #[test]
    fn chunked_multiple_chunks() {
        let (mut stream, _) = stream_over(b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new(0);
        assert_eq!(drain_chunked(&mut reader, &mut stream), b"hello, world");
    }

    #[test]
    fn chunked_extensions_are_discarded() {
        let (mut stream, _) = stream_over(b"5;name=value\r\nhello\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new(0);
        assert_eq!(drain_chunked(&mut reader, &mut stream), b"hello");
    }

    #[test]
    fn chunked_trailers_are_consumed() {
        let (mut stream, _) = stream_over(b"5\r\nhello\r\n0\r\nExpires: never\r\n\r\nGET ");
        let mut reader = ChunkedReader::new(0);
        assert_eq!(drain_chunked(&mut reader, &mut stream), b"hello");
        assert!(reader.is_done());
        // The next request's bytes stay in the stream buffer untouched.
        let mut rest = [0u8; 4];
        std::io::Read::read(&mut stream, &mut rest).unwrap();
        assert_eq!(&rest, b"GET ");
    }

    #[test]
    fn chunked_empty_body() {
        let (mut stream, _) = stream_over(b"0\r\n\r\n");
        let mut reader = ChunkedReader::new(0);
        assert_eq!(drain_chunked(&mut reader, &mut stream), b"");
        assert!(reader.is_done());
    }

    #[test]
    fn chunked_invalid_size_is_malformed() {
        let (mut stream, _) = stream_over(b"xyz\r\nhello\r\n");
        let mut reader = ChunkedReader::new(0);
        let mut buf = [0u8; 8];
        match reader.read(&mut stream, &mut buf) {
            Err(ParseError::MalformedChunk { .. }) => {}
            other => panic!("expected MalformedChunk, got {other:?}"),
        }
    }

    #[test]
    fn chunked_missing_crlf_is_malformed() {
        let (mut stream, _) = stream_over(b"5\r\nhelloXX0\r\n\r\n");
        let mut reader = ChunkedReader::new(0);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut stream, &mut buf).unwrap(), 5);
        match reader.read(&mut stream, &mut buf) {
            Err(ParseError::MalformedChunk { .. }) => {}
            other => panic!("expected MalformedChunk, got {other:?}"),
        }
    }

    #[test]
    fn chunked_size_overflow_is_malformed() {
        let (mut stream, _) = stream_over(b"fffffffffffffffff\r\n");
        let mut reader = ChunkedReader::new(0);
        let mut buf = [0u8; 8];
        match reader.read(&mut stream, &mut buf) {
            Err(ParseError::MalformedChunk { .. }) => {}
            other => panic!("expected MalformedChunk, got {other:?}"),
        }
    }

    #[test]
    fn chunked_body_cap_is_enforced() {
        let (mut stream, _) = stream_over(b"a\r\n0123456789\r\n0\r\n\r\n");
        let mut reader = ChunkedReader::new(8);
        let mut buf = [0u8; 32];
        match reader.read(&mut stream, &mut buf) {
            Err(ParseError::EntityTooLarge { max }) => assert_eq!(max, 8),
            other => panic!("expected EntityTooLarge, got {other:?}"),
        }
    }
}
