//! Buffered byte I/O over one accepted socket.
//!
//! [`SocketStream`] is a duplex buffered stream: a read buffer and a write
//! buffer over a single owned transport. Both directions count bytes, the
//! read side can report whether decoded-but-unconsumed data is pending
//! (`has_data`, the condition for selector re-registration), and the write
//! side flushes in [`SOCK_WRITE_BLOCKSIZE`] slices so a large response
//! never sits in memory as one giant syscall argument.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

pub mod body;

pub use body::{CappedLineReader, ChunkedReader, LengthReader};

/// Write at most this many bytes to the socket per syscall.
pub const SOCK_WRITE_BLOCKSIZE: usize = 16 * 1024;

/// Default size of the read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// One accepted transport: plain TCP, a local socket, or a TLS-wrapped
/// stream produced by an adapter.
///
/// The selector registers the raw fd while the connection idles between
/// requests; timeouts bound every blocking read and write a worker makes.
pub trait Transport: Read + Write + Send {
    fn raw_fd(&self) -> RawFd;

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Shut down the transport. TLS transports send their close alert
    /// here, which is why this takes `&mut self`.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Plaintext bytes already decrypted but not yet surfaced by `read`.
    ///
    /// TLS transports can hold such bytes; plain sockets never do. A
    /// transport with pending plaintext must not be parked in the selector,
    /// which only sees kernel-level readability.
    fn pending_plaintext(&mut self) -> bool {
        false
    }
}

impl Transport for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}

impl Transport for UnixStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, how)
    }
}

/// A buffered duplex stream over one transport.
pub struct SocketStream {
    transport: Box<dyn Transport>,
    rbuf: Vec<u8>,
    rpos: usize,
    rfilled: usize,
    wbuf: Vec<u8>,
    wbufsize: usize,
    bytes_read: u64,
    bytes_written: u64,
}

impl SocketStream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_buffer_sizes(transport, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_sizes(
        transport: Box<dyn Transport>,
        rbufsize: usize,
        wbufsize: usize,
    ) -> Self {
        Self {
            transport,
            rbuf: vec![0; rbufsize.max(1)],
            rpos: 0,
            rfilled: 0,
            wbuf: Vec::with_capacity(wbufsize),
            wbufsize,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Total bytes consumed from the transport. Monotonically
    /// non-decreasing for the life of the connection.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes handed to the transport. Monotonically non-decreasing.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// True if buffered input is waiting to be consumed.
    ///
    /// A connection answering true must not be parked in the selector:
    /// the kernel would never report it readable for bytes this buffer
    /// already holds.
    pub fn has_data(&mut self) -> bool {
        self.rpos < self.rfilled || self.transport.pending_plaintext()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    pub fn set_timeouts(&self, dur: Option<Duration>) -> io::Result<()> {
        self.transport.set_read_timeout(dur)?;
        self.transport.set_write_timeout(dur)
    }

    pub fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.transport.shutdown(how)
    }

    fn fill(&mut self) -> io::Result<usize> {
        debug_assert!(self.rpos >= self.rfilled);
        let n = self.transport.read(&mut self.rbuf)?;
        self.rpos = 0;
        self.rfilled = n;
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// The buffered bytes not yet consumed, filling from the transport if
    /// the buffer is empty. An empty return slice means end of stream.
    pub fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.rpos >= self.rfilled {
            self.fill()?;
        }
        Ok(&self.rbuf[self.rpos..self.rfilled])
    }

    pub fn consume(&mut self, amt: usize) {
        self.rpos = (self.rpos + amt).min(self.rfilled);
    }

    /// Read one line, including its terminator, appending to `out`.
    ///
    /// Stops after a LF or at end of stream. Returns the number of bytes
    /// appended; zero means the stream ended before any byte arrived.
    /// At most `limit` bytes are consumed; exceeding it returns `false`
    /// in the second tuple slot with exactly `limit` bytes read.
    pub fn read_line(&mut self, out: &mut Vec<u8>, limit: usize) -> io::Result<(usize, bool)> {
        let mut total = 0;
        while total < limit {
            let available = self.fill_buf()?;
            if available.is_empty() {
                return Ok((total, true));
            }
            let budget = limit - total;
            let window = &available[..available.len().min(budget)];
            match memchr(b'\n', window) {
                Some(pos) => {
                    out.extend_from_slice(&window[..=pos]);
                    self.consume(pos + 1);
                    return Ok((total + pos + 1, true));
                }
                None => {
                    let n = window.len();
                    out.extend_from_slice(window);
                    self.consume(n);
                    total += n;
                }
            }
        }
        Ok((total, false))
    }

    /// Buffer `buf` for writing, flushing complete blocks as they fill.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.wbuf.extend_from_slice(buf);
        if self.wbuf.len() >= self.wbufsize {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Drive the write buffer all the way into the transport.
    ///
    /// Retries partial writes until the buffer is empty or the transport
    /// errors; interrupted syscalls are retried.
    pub fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.wbuf.len() {
            let end = (written + SOCK_WRITE_BLOCKSIZE).min(self.wbuf.len());
            match self.transport.write(&self.wbuf[written..end]) {
                Ok(0) => {
                    self.wbuf.drain(..written);
                    self.bytes_written += written as u64;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted zero bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.wbuf.drain(..written);
                    self.bytes_written += written as u64;
                    return Err(e);
                }
            }
        }
        self.bytes_written += written as u64;
        self.wbuf.clear();
        self.transport.flush()
    }
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Large reads bypass the buffer once it is drained.
        if self.rpos >= self.rfilled && buf.len() >= self.rbuf.len() {
            let n = self.transport.read(buf)?;
            self.bytes_read += n as u64;
            return Ok(n);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory transport for unit tests: a scripted read side and a
    /// captured write side.
    pub struct ScriptedTransport {
        input: VecDeque<u8>,
        pub output: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedTransport {
        pub fn new(input: &[u8]) -> Self {
            Self {
                input: input.iter().copied().collect(),
                output: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn raw_fd(&self) -> RawFd {
            -1
        }

        fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn stream_over(input: &[u8]) -> (SocketStream, Arc<Mutex<Vec<u8>>>) {
        let transport = ScriptedTransport::new(input);
        let output = transport.output.clone();
        (SocketStream::new(Box::new(transport)), output)
    }
}
