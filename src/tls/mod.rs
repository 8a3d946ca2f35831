//! TLS termination as a strategy object.
//!
//! A [`TlsAdapter`] owns the capability set the engine needs from a TLS
//! stack: prepare a listening socket, wrap an accepted socket into an
//! encrypted transport, and describe the session and peer certificate as
//! `SSL_*` environment entries. Two implementations ship: the built-in
//! rustls adapter ([`builtin`]) and an OpenSSL binding behind the
//! `openssl` cargo feature.

use std::collections::BTreeMap;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;

pub(crate) use crate::errors::TlsError;
use crate::stream::Transport;

pub mod builtin;
#[cfg(feature = "openssl")]
pub mod openssl;

pub use builtin::BuiltinTlsAdapter;

/// Certificate and session metadata for one wrapped connection,
/// `SSL_CLIENT_*`/`SSL_SERVER_*` keyed the mod_ssl way.
pub type TlsEnv = BTreeMap<String, String>;

/// Outcome of wrapping an accepted socket.
pub enum Wrapped {
    /// Handshake complete; the transport decrypts transparently.
    Tls(Box<dyn Transport>, TlsEnv),
    /// The client spoke plain HTTP. The raw socket is handed back so the
    /// server can answer with a plain-text 400 before closing.
    PlainHttp(TcpStream),
}

/// Source of the private-key passphrase.
///
/// The callback form is invoked lazily while key material loads, at most
/// twice, and must produce the passphrase bytes each time.
pub enum KeyPassword {
    Literal(Vec<u8>),
    Prompt(Box<dyn Fn() -> Vec<u8> + Send + Sync>),
}

impl KeyPassword {
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Literal(bytes.into())
    }

    pub fn prompt(f: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self::Prompt(Box::new(f))
    }

    pub(crate) fn reveal(&self) -> Vec<u8> {
        match self {
            Self::Literal(bytes) => bytes.clone(),
            Self::Prompt(f) => f(),
        }
    }
}

impl std::fmt::Debug for KeyPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(_) => f.write_str("KeyPassword::Literal(..)"),
            Self::Prompt(_) => f.write_str("KeyPassword::Prompt(..)"),
        }
    }
}

/// Wraps accepted sockets and exposes peer-certificate metadata.
pub trait TlsAdapter: Send + Sync {
    /// Prepare the listening socket. Most stacks need nothing here.
    fn bind(&self, _listener: &std::net::TcpListener) -> std::io::Result<()> {
        Ok(())
    }

    /// Perform the server-side handshake on an accepted socket.
    fn wrap(&self, sock: TcpStream) -> Result<Wrapped, TlsError>;
}

/// Peek at the first bytes of an accepted socket for a plain HTTP verb.
///
/// Best effort: if nothing arrives within the peek window the handshake
/// proceeds and fails on its own terms.
pub(crate) fn looks_like_plain_http(sock: &TcpStream) -> bool {
    const PEEK_BYTES: usize = 16;
    const METHODS: &[&[u8]] = &[
        b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
        b"TRACE ",
    ];

    let previous = sock.read_timeout().ok().flatten();
    let _ = sock.set_read_timeout(Some(std::time::Duration::from_millis(500)));

    let mut buf = [0u8; PEEK_BYTES];
    let n = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            PEEK_BYTES,
            libc::MSG_PEEK,
        )
    };

    let _ = sock.set_read_timeout(previous);

    if n <= 0 {
        return false;
    }
    let head = &buf[..n as usize];
    METHODS.iter().any(|m| head.starts_with(m) || m.starts_with(head))
}

/// mod_ssl short codes for DN attribute types.
///
/// Components are serialized `CODE=value` joined with `,`; multi-valued
/// attributes additionally appear comma-joined under their own key.
pub(crate) mod dn {
    use super::TlsEnv;
    use x509_parser::prelude::*;

    fn attr_code(attr: &AttributeTypeAndValue<'_>) -> Option<&'static str> {
        use x509_parser::oid_registry::*;
        let oid = attr.attr_type();
        Some(if *oid == OID_X509_COUNTRY_NAME {
            "C"
        } else if *oid == OID_X509_STATE_OR_PROVINCE_NAME {
            "ST"
        } else if *oid == OID_X509_LOCALITY_NAME {
            "L"
        } else if *oid == OID_X509_ORGANIZATION_NAME {
            "O"
        } else if *oid == OID_X509_ORGANIZATIONAL_UNIT {
            "OU"
        } else if *oid == OID_X509_COMMON_NAME {
            "CN"
        } else if *oid == OID_X509_TITLE {
            "T"
        } else if *oid == OID_X509_GIVEN_NAME {
            "G"
        } else if *oid == OID_X509_SURNAME {
            "S"
        } else if *oid == OID_PKCS9_EMAIL_ADDRESS {
            "Email"
        } else {
            return None;
        })
    }

    /// Flatten one DN into `prefix`, `prefix_CODE` and, for repeated
    /// codes, `prefix_CODE_<i>` entries.
    pub(crate) fn environ(prefix: &str, name: &X509Name<'_>, env: &mut TlsEnv) {
        let mut parts: Vec<String> = Vec::new();
        let mut by_code: Vec<(&'static str, Vec<String>)> = Vec::new();

        for rdn in name.iter() {
            for attr in rdn.iter() {
                let Ok(value) = attr.as_str() else { continue };
                let Some(code) = attr_code(attr) else {
                    parts.push(format!("{}={}", attr.attr_type(), value));
                    continue;
                };
                parts.push(format!("{code}={value}"));
                match by_code.iter_mut().find(|(c, _)| *c == code) {
                    Some((_, values)) => values.push(value.to_owned()),
                    None => by_code.push((code, vec![value.to_owned()])),
                }
            }
        }

        if parts.is_empty() {
            return;
        }
        env.insert(prefix.to_owned(), parts.join(","));
        for (code, values) in by_code {
            env.insert(format!("{prefix}_{code}"), values.join(","));
            if values.len() > 1 {
                for (i, value) in values.iter().enumerate() {
                    env.insert(format!("{prefix}_{code}_{i}"), value.clone());
                }
            }
        }
    }

    /// Subject and issuer DN entries for a DER certificate.
    pub(crate) fn cert_environ(prefix: &str, der: &[u8], env: &mut TlsEnv) {
        let Ok((_, cert)) = X509Certificate::from_der(der) else {
            tracing::warn!(prefix, "could not parse certificate for environment");
            return;
        };
        environ(&format!("{prefix}_S_DN"), cert.subject(), env);
        environ(&format!("{prefix}_I_DN"), cert.issuer(), env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_password_forms() {
        let literal = KeyPassword::literal("hunter2");
        assert_eq!(literal.reveal(), b"hunter2");

        let prompted = KeyPassword::prompt(|| b"swordfish".to_vec());
        assert_eq!(prompted.reveal(), b"swordfish");
        assert_eq!(prompted.reveal(), b"swordfish");
    }
}
