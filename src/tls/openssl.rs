//! The OpenSSL-binding TLS adapter (cargo feature `openssl`).
//!
//! Covers what the built-in adapter declines: encrypted private keys via
//! the passphrase source and an explicit cipher list. Session and peer
//! certificate metadata come straight from the OpenSSL objects.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

use ::openssl::pkey::PKey;
use ::openssl::ssl::{
    HandshakeError, SslAcceptor, SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use ::openssl::x509::X509NameRef;
use tracing::{debug, warn};

use crate::errors::TlsError;
use crate::stream::Transport;
use crate::tls::{looks_like_plain_http, KeyPassword, TlsAdapter, TlsEnv, Wrapped};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake failures OpenSSL reports for peers that were never going to
/// complete one; swallowed without logging.
const BENIGN_MARKERS: &[&str] =
    &["http request", "https proxy request", "unknown protocol", "wrong version number", "unknown error"];

pub struct OpenSslAdapter {
    acceptor: SslAcceptor,
    base_env: TlsEnv,
}

impl OpenSslAdapter {
    pub fn new(
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        certificate_chain: Option<PathBuf>,
        ciphers: Option<String>,
        private_key_password: Option<KeyPassword>,
    ) -> Result<Self, TlsError> {
        let certificate = certificate.into();
        let private_key = private_key.into();

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(|e| TlsError::config(e.to_string()))?;

        match private_key_password {
            None => builder
                .set_private_key_file(&private_key, SslFiletype::PEM)
                .map_err(|e| TlsError::config(format!("private key: {e}")))?,
            Some(password) => {
                let pem = std::fs::read(&private_key)
                    .map_err(|e| TlsError::config(format!("private key: {e}")))?;
                let key = PKey::private_key_from_pem_passphrase(&pem, &password.reveal())
                    .map_err(|e| TlsError::config(format!("private key: {e}")))?;
                builder
                    .set_private_key(&key)
                    .map_err(|e| TlsError::config(format!("private key: {e}")))?;
            }
        }

        builder
            .set_certificate_chain_file(&certificate)
            .map_err(|e| TlsError::config(format!("certificate: {e}")))?;
        builder
            .check_private_key()
            .map_err(|e| TlsError::config(format!("certificate/key mismatch: {e}")))?;

        if let Some(chain) = &certificate_chain {
            builder
                .set_ca_file(chain)
                .map_err(|e| TlsError::config(format!("CA chain: {e}")))?;
            // Request a client certificate without requiring one.
            builder.set_verify(SslVerifyMode::PEER);
        }

        if let Some(ciphers) = &ciphers {
            builder
                .set_cipher_list(ciphers)
                .map_err(|e| TlsError::config(format!("cipher list: {e}")))?;
        }

        let mut base_env = TlsEnv::new();
        base_env.insert("HTTPS".to_owned(), "on".to_owned());
        base_env
            .insert("SSL_VERSION_LIBRARY".to_owned(), ::openssl::version::version().to_owned());

        Ok(Self { acceptor: builder.build(), base_env })
    }

    fn environ(&self, stream: &SslStream<TcpStream>) -> TlsEnv {
        let ssl = stream.ssl();
        let mut env = self.base_env.clone();
        env.insert("SSL_PROTOCOL".to_owned(), ssl.version_str().to_owned());
        if let Some(cipher) = ssl.current_cipher() {
            env.insert("SSL_CIPHER".to_owned(), cipher.name().to_owned());
        }
        match ssl.peer_certificate() {
            Some(cert) => {
                env.insert("SSL_CLIENT_VERIFY".to_owned(), "SUCCESS".to_owned());
                name_environ("SSL_CLIENT_S_DN", cert.subject_name(), &mut env);
                name_environ("SSL_CLIENT_I_DN", cert.issuer_name(), &mut env);
            }
            None => {
                env.insert("SSL_CLIENT_VERIFY".to_owned(), "NONE".to_owned());
            }
        }
        env
    }
}

/// Flatten an X509 name into `prefix` and `prefix_CODE` entries, comma
/// separated, mirroring the builtin adapter's serialization.
fn name_environ(prefix: &str, name: &X509NameRef, env: &mut TlsEnv) {
    let mut parts: Vec<String> = Vec::new();
    let mut by_code: Vec<(String, Vec<String>)> = Vec::new();
    for entry in name.entries() {
        let code = entry.object().nid().short_name().unwrap_or("UNKNOWN").to_owned();
        let Ok(value) = entry.data().as_utf8() else { continue };
        let value = value.to_string();
        parts.push(format!("{code}={value}"));
        match by_code.iter_mut().find(|(c, _)| *c == code) {
            Some((_, values)) => values.push(value),
            None => by_code.push((code, vec![value])),
        }
    }
    if parts.is_empty() {
        return;
    }
    env.insert(prefix.to_owned(), parts.join(","));
    for (code, values) in by_code {
        env.insert(format!("{prefix}_{code}"), values.join(","));
    }
}

impl TlsAdapter for OpenSslAdapter {
    fn wrap(&self, sock: TcpStream) -> Result<Wrapped, TlsError> {
        if looks_like_plain_http(&sock) {
            return Ok(Wrapped::PlainHttp(sock));
        }

        let previous_timeout = sock.read_timeout().ok().flatten();
        let _ = sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
        let _ = sock.set_write_timeout(Some(HANDSHAKE_TIMEOUT));

        let stream = match self.acceptor.accept(sock) {
            Ok(stream) => stream,
            Err(err) => return Err(classify_handshake_error(err)),
        };

        let _ = stream.get_ref().set_read_timeout(previous_timeout);
        let _ = stream.get_ref().set_write_timeout(previous_timeout);

        let env = self.environ(&stream);
        debug!(protocol = env.get("SSL_PROTOCOL").map(String::as_str), "tls handshake complete");
        Ok(Wrapped::Tls(Box::new(OpenSslStream { inner: stream }), env))
    }
}

fn classify_handshake_error(err: HandshakeError<TcpStream>) -> TlsError {
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    if BENIGN_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return TlsError::benign(text);
    }
    match &err {
        HandshakeError::WouldBlock(_) => TlsError::benign("handshake timed out"),
        HandshakeError::Failure(mid) => {
            let io_err = mid.error().io_error();
            if io_err.map(|e| crate::errors::is_benign_socket_error(e)).unwrap_or(false) {
                TlsError::benign(text)
            } else {
                warn!(error = %text, "tls handshake failed");
                TlsError::handshake(text)
            }
        }
        HandshakeError::SetupFailure(_) => TlsError::config(text),
    }
}

struct OpenSslStream {
    inner: SslStream<TcpStream>,
}

impl Read for OpenSslStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for OpenSslStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for OpenSslStream {
    fn raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.get_ref().set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.get_ref().set_write_timeout(dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            let _ = self.inner.shutdown();
        }
        self.inner.get_ref().shutdown(how)
    }

    fn pending_plaintext(&mut self) -> bool {
        self.inner.ssl().pending() > 0
    }
}
