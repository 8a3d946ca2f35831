//! The built-in TLS adapter, backed by rustls.
//!
//! PEM certificate and key material is loaded at construction; each
//! accepted socket gets a server-side handshake driven to completion on
//! the wrapping thread. Client certificates are requested (but not
//! required) when a CA chain is configured, and the peer certificate's
//! subject and issuer DNs are flattened into `SSL_CLIENT_*` entries.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConnection, StreamOwned};
use tracing::{debug, warn};

use crate::errors::TlsError;
use crate::stream::Transport;
use crate::tls::{dn, looks_like_plain_http, KeyPassword, TlsAdapter, TlsEnv, Wrapped};

/// Give a handshake this long before closing the connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct BuiltinTlsAdapter {
    config: Arc<rustls::ServerConfig>,
    /// `SSL_SERVER_*` entries shared by every connection.
    base_env: TlsEnv,
}

impl BuiltinTlsAdapter {
    /// Build an adapter from PEM files.
    ///
    /// `certificate_chain` doubles as the client-CA bundle: when present,
    /// client certificates are requested and verified against it.
    /// Encrypted private keys are not supported by this adapter (use the
    /// OpenSSL one), and a cipher list is ignored, since rustls negotiates
    /// from its own vetted suite set.
    pub fn new(
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        certificate_chain: Option<PathBuf>,
        ciphers: Option<String>,
        private_key_password: Option<KeyPassword>,
    ) -> Result<Self, TlsError> {
        let certificate = certificate.into();
        let private_key = private_key.into();

        if private_key_password.is_some() {
            return Err(TlsError::config(
                "encrypted private keys are not supported by the builtin adapter; \
                 use the openssl adapter",
            ));
        }
        if ciphers.is_some() {
            warn!("cipher list is ignored by the builtin adapter");
        }

        let certs = load_certs(&certificate)?;
        let key = load_key(&private_key)?;

        let builder = match &certificate_chain {
            Some(chain) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(chain)? {
                    roots
                        .add(cert)
                        .map_err(|e| TlsError::config(format!("bad CA certificate: {e}")))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| TlsError::config(format!("client verifier: {e}")))?;
                rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
            }
            None => rustls::ServerConfig::builder().with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(certs.clone(), key)
            .map_err(|e| TlsError::config(format!("certificate/key mismatch: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut base_env = TlsEnv::new();
        base_env.insert("HTTPS".to_owned(), "on".to_owned());
        base_env.insert("SSL_VERSION_LIBRARY".to_owned(), "rustls".to_owned());
        if let Some(cert) = certs.first() {
            dn::cert_environ("SSL_SERVER", cert, &mut base_env);
        }

        Ok(Self { config: Arc::new(config), base_env })
    }

    fn environ(&self, conn: &ServerConnection) -> TlsEnv {
        let mut env = self.base_env.clone();
        env.insert(
            "SSL_PROTOCOL".to_owned(),
            match conn.protocol_version() {
                Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2".to_owned(),
                Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3".to_owned(),
                Some(other) => format!("{other:?}"),
                None => "TLS".to_owned(),
            },
        );
        if let Some(suite) = conn.negotiated_cipher_suite() {
            env.insert("SSL_CIPHER".to_owned(), format!("{:?}", suite.suite()));
        }
        match conn.peer_certificates().and_then(|certs| certs.first()) {
            Some(client_cert) => {
                env.insert("SSL_CLIENT_VERIFY".to_owned(), "SUCCESS".to_owned());
                dn::cert_environ("SSL_CLIENT", client_cert, &mut env);
            }
            // Absence of a client certificate is not an error.
            None => {
                env.insert("SSL_CLIENT_VERIFY".to_owned(), "NONE".to_owned());
            }
        }
        env
    }
}

impl TlsAdapter for BuiltinTlsAdapter {
    fn wrap(&self, sock: TcpStream) -> Result<Wrapped, TlsError> {
        if looks_like_plain_http(&sock) {
            return Ok(Wrapped::PlainHttp(sock));
        }

        let mut conn = ServerConnection::new(self.config.clone())
            .map_err(|e| TlsError::config(format!("session setup: {e}")))?;

        let previous_timeout = sock.read_timeout().ok().flatten();
        let _ = sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
        let _ = sock.set_write_timeout(Some(HANDSHAKE_TIMEOUT));

        let mut sock = sock;
        while conn.is_handshaking() {
            if let Err(err) = conn.complete_io(&mut sock) {
                return Err(classify_handshake_error(err));
            }
        }

        let _ = sock.set_read_timeout(previous_timeout);
        let _ = sock.set_write_timeout(previous_timeout);

        let env = self.environ(&conn);
        debug!(protocol = env.get("SSL_PROTOCOL").map(String::as_str), "tls handshake complete");
        Ok(Wrapped::Tls(Box::new(BuiltinTlsStream { inner: StreamOwned::new(conn, sock) }), env))
    }
}

fn classify_handshake_error(err: io::Error) -> TlsError {
    use io::ErrorKind::*;
    match err.kind() {
        // The peer vanished, probed, or never spoke; nothing to log.
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
            TlsError::benign(err.to_string())
        }
        WouldBlock | TimedOut => TlsError::benign("handshake timed out"),
        InvalidData => match err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
            Some(rustls::Error::AlertReceived(alert)) => {
                TlsError::benign(format!("peer alert {alert:?}"))
            }
            Some(rustls::Error::InappropriateMessage { .. })
            | Some(rustls::Error::InappropriateHandshakeMessage { .. }) => {
                TlsError::benign("peer is not speaking TLS")
            }
            _ => TlsError::handshake(err.to_string()),
        },
        _ => TlsError::handshake(err.to_string()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::config(format!("cannot open {}: {e}", path.display())))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs =
        certs.map_err(|e| TlsError::config(format!("bad PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TlsError::config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::config(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::config(format!("bad PEM in {}: {e}", path.display())))?
        .ok_or_else(|| TlsError::config(format!("no private key in {}", path.display())))
}

struct BuiltinTlsStream {
    inner: StreamOwned<ServerConnection, TcpStream>,
}

impl Read for BuiltinTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for BuiltinTlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for BuiltinTlsStream {
    fn raw_fd(&self) -> RawFd {
        self.inner.sock.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.sock.set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.sock.set_write_timeout(dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            // Best-effort close alert so conforming peers see a clean end
            // of stream rather than a truncation.
            self.inner.conn.send_close_notify();
            while self.inner.conn.wants_write() {
                if self.inner.conn.write_tls(&mut self.inner.sock).is_err() {
                    break;
                }
            }
        }
        self.inner.sock.shutdown(how)
    }

    fn pending_plaintext(&mut self) -> bool {
        self.inner
            .conn
            .process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn self_signed_pems(dir: &Path) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("berth-tls-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn adapter_construction_from_pems() {
        let dir = temp_dir("construct");
        let (cert, key) = self_signed_pems(&dir);
        let adapter = BuiltinTlsAdapter::new(&cert, &key, None, None, None).unwrap();
        assert_eq!(adapter.base_env.get("HTTPS").map(String::as_str), Some("on"));
        assert!(adapter
            .base_env
            .get("SSL_SERVER_S_DN")
            .map(|dn| dn.contains("CN="))
            .unwrap_or(false));
    }

    #[test]
    fn key_password_is_refused() {
        let dir = temp_dir("password");
        let (cert, key) = self_signed_pems(&dir);
        let err = BuiltinTlsAdapter::new(
            &cert,
            &key,
            None,
            None,
            Some(KeyPassword::literal("secret")),
        )
        .unwrap_err();
        assert!(matches!(err, TlsError::Config { .. }));
    }

    #[test]
    fn plain_http_client_is_detected() {
        let dir = temp_dir("plain");
        let (cert, key) = self_signed_pems(&dir);
        let adapter = BuiltinTlsAdapter::new(&cert, &key, None, None, None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut sock = TcpStream::connect(addr).unwrap();
            sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            sock
        });

        let (accepted, _) = listener.accept().unwrap();
        match adapter.wrap(accepted).unwrap() {
            Wrapped::PlainHttp(_) => {}
            Wrapped::Tls(..) => panic!("plain HTTP client was not detected"),
        }
        drop(client.join().unwrap());
    }

    #[test]
    fn handshake_with_rustls_client() {
        let dir = temp_dir("handshake");
        let (cert_path, key_path) = self_signed_pems(&dir);
        let adapter =
            BuiltinTlsAdapter::new(&cert_path, &key_path, None, None, None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut roots = RootCertStore::empty();
        for cert in load_certs(&cert_path).unwrap() {
            roots.add(cert).unwrap();
        }
        let client_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        let client = std::thread::spawn(move || {
            let sock = TcpStream::connect(addr).unwrap();
            let server_name =
                rustls::pki_types::ServerName::try_from("localhost".to_owned()).unwrap();
            let conn = rustls::ClientConnection::new(client_config, server_name).unwrap();
            let mut stream = StreamOwned::new(conn, sock);
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let (accepted, _) = listener.accept().unwrap();
        let (mut transport, env) = match adapter.wrap(accepted).unwrap() {
            Wrapped::Tls(transport, env) => (transport, env),
            Wrapped::PlainHttp(_) => panic!("handshake misdetected as plain HTTP"),
        };
        assert_eq!(env.get("SSL_CLIENT_VERIFY").map(String::as_str), Some("NONE"));
        assert!(env.get("SSL_PROTOCOL").unwrap().starts_with("TLSv1."));

        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        transport.write_all(b"pong").unwrap();
        transport.flush().unwrap();

        assert_eq!(&client.join().unwrap(), b"pong");
    }
}
