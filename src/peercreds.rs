//! Peer credentials of local-socket clients.
//!
//! On Linux, `SO_PEERCRED` yields the PID/UID/GID of the process on the
//! other end of a `AF_UNIX` socket. Name resolution goes through the
//! system user and group databases. Results are cached per connection;
//! on non-local sockets or unsupported platforms every accessor fails
//! with [`PeerCredsError`], an internal condition, never an HTTP error.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::errors::PeerCredsError;

/// OS identity of the peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Per-connection cache of credential lookups.
///
/// Lives on the connection and moves with it between the manager and
/// workers; only one thread touches it at a time.
pub(crate) struct CredsCache {
    fd: RawFd,
    is_local: bool,
    creds: OnceCell<PeerCreds>,
    names: OnceCell<(String, String)>,
}

impl CredsCache {
    pub(crate) fn new(fd: RawFd, is_local: bool) -> Self {
        Self { fd, is_local, creds: OnceCell::new(), names: OnceCell::new() }
    }

    pub(crate) fn get(&self) -> Result<PeerCreds, PeerCredsError> {
        if !self.is_local {
            return Err(PeerCredsError::NotLocalSocket);
        }
        if let Some(creds) = self.creds.get() {
            return Ok(*creds);
        }
        let creds = peer_creds_of(self.fd)?;
        Ok(*self.creds.get_or_init(|| creds))
    }

    pub(crate) fn resolve_names(&self) -> Result<(String, String), PeerCredsError> {
        if let Some(names) = self.names.get() {
            return Ok(names.clone());
        }
        let creds = self.get()?;
        let user = user_name(creds.uid)?;
        let group = group_name(creds.gid)?;
        Ok(self.names.get_or_init(|| (user, group)).clone())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_creds_of(fd: RawFd) -> Result<PeerCreds, PeerCredsError> {
    let mut ucred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(PeerCredsError::Lookup { source: io::Error::last_os_error() });
    }
    Ok(PeerCreds { pid: ucred.pid, uid: ucred.uid, gid: ucred.gid })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_creds_of(_fd: RawFd) -> Result<PeerCreds, PeerCredsError> {
    Err(PeerCredsError::Unsupported)
}

fn user_name(uid: u32) -> Result<String, PeerCredsError> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; passwd_buffer_size()];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr() as *mut libc::c_char, buf.len(), &mut result)
    };
    if rc != 0 {
        return Err(PeerCredsError::Lookup { source: io::Error::from_raw_os_error(rc) });
    }
    if result.is_null() {
        return Err(PeerCredsError::Lookup {
            source: io::Error::new(io::ErrorKind::NotFound, format!("unknown uid {uid}")),
        });
    }
    Ok(unsafe { c_string_field(pwd.pw_name) })
}

fn group_name(gid: u32) -> Result<String, PeerCredsError> {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; passwd_buffer_size()];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr() as *mut libc::c_char, buf.len(), &mut result)
    };
    if rc != 0 {
        return Err(PeerCredsError::Lookup { source: io::Error::from_raw_os_error(rc) });
    }
    if result.is_null() {
        return Err(PeerCredsError::Lookup {
            source: io::Error::new(io::ErrorKind::NotFound, format!("unknown gid {gid}")),
        });
    }
    Ok(unsafe { c_string_field(grp.gr_name) })
}

fn passwd_buffer_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

/// The pointee must be a NUL-terminated string owned by the out-structs
/// of a successful `getpw*_r`/`getgr*_r` call.
unsafe fn c_string_field(ptr: *const libc::c_char) -> String {
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Environment keys for a resolved peer.
///
/// `X_REMOTE_PID`/`X_REMOTE_UID`/`X_REMOTE_GID` always; `X_REMOTE_USER`
/// (mirrored as `REMOTE_USER`) and `X_REMOTE_GROUP` when names were
/// resolved.
pub fn environ(creds: PeerCreds, names: Option<&(String, String)>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("X_REMOTE_PID".to_owned(), creds.pid.to_string());
    env.insert("X_REMOTE_UID".to_owned(), creds.uid.to_string());
    env.insert("X_REMOTE_GID".to_owned(), creds.gid.to_string());
    if let Some((user, group)) = names {
        env.insert("X_REMOTE_USER".to_owned(), user.clone());
        env.insert("REMOTE_USER".to_owned(), user.clone());
        env.insert("X_REMOTE_GROUP".to_owned(), group.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_local_socket_is_refused() {
        let cache = CredsCache::new(-1, false);
        assert!(matches!(cache.get(), Err(PeerCredsError::NotLocalSocket)));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn own_socketpair_reports_own_identity() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (a, _b) = UnixStream::pair().unwrap();
        let cache = CredsCache::new(a.as_raw_fd(), true);
        let creds = cache.get().unwrap();
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, unsafe { libc::getuid() });
        assert_eq!(creds.gid, unsafe { libc::getgid() });

        // Cached: same answer without another syscall path.
        assert_eq!(cache.get().unwrap(), creds);
    }

    #[test]
    fn environ_keys() {
        let creds = PeerCreds { pid: 42, uid: 1000, gid: 1000 };
        let names = ("alice".to_owned(), "staff".to_owned());
        let env = environ(creds, Some(&names));
        assert_eq!(env["X_REMOTE_PID"], "42");
        assert_eq!(env["X_REMOTE_USER"], "alice");
        assert_eq!(env["REMOTE_USER"], "alice");
        assert_eq!(env["X_REMOTE_GROUP"], "staff");

        let bare = environ(creds, None);
        assert!(bare.contains_key("X_REMOTE_UID"));
        assert!(!bare.contains_key("REMOTE_USER"));
    }
}
