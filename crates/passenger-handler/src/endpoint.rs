//! Private Unix-domain listening endpoint.
//!
//! Every handler owns exactly one endpoint with a freshly generated,
//! unguessable name. On Linux the endpoint prefers the abstract namespace
//! (no filesystem inode, disappears with the process); elsewhere, or when
//! [`NO_ABSTRACT_NAMESPACE_ENV`] is set to a non-empty value, it falls back
//! to a filesystem socket under `/tmp` with owner-only permissions.
//!
//! Name collisions on creation are resolved by regenerating the identity
//! and retrying, without bound: with 512 bits of entropy a collision means
//! another live handler happened to pick the same name, not an error state.
//!
//! # Socket-name contract
//!
//! The exposed [`SocketEndpoint::socket_name`] never contains the leading
//! NUL of an abstract address; [`connect`] re-adds it. Filesystem names are
//! plain paths.

use std::fmt;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{HandlerError, Result};
use crate::identity::{self, UNIX_PATH_MAX};

/// Listen backlog for every handler endpoint.
pub const BACKLOG_SIZE: i32 = 50;

/// Environment variable disabling abstract-namespace sockets.
///
/// Unset or empty: the abstract namespace is preferred where the OS has
/// one. Any non-empty value: filesystem sockets only.
pub const NO_ABSTRACT_NAMESPACE_ENV: &str = "PASSENGER_NO_ABSTRACT_NAMESPACE_SOCKETS";

/// Filename prefix for filesystem-backed sockets.
const SOCKET_PREFIX: &str = "/tmp/passenger.";

/// Which namespace the endpoint was created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Kernel-managed abstract namespace (Linux only).
    Abstract,
    /// Filesystem inode, mode 0600, unlinked on cleanup.
    Filesystem,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abstract => f.write_str("abstract"),
            Self::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// A listening stream socket with a private random name.
///
/// The listener is created in nonblocking mode so it can be registered
/// with an async runtime via [`SocketEndpoint::register`]. Dropping the
/// endpoint closes the descriptor and, for filesystem sockets, unlinks the
/// path (best-effort).
#[derive(Debug)]
pub struct SocketEndpoint {
    listener: StdUnixListener,
    socket_name: String,
    kind: SocketKind,
}

impl SocketEndpoint {
    /// Creates a listening endpoint bound to a freshly generated name.
    ///
    /// # Errors
    ///
    /// Returns an error when neither socket flavor can be created. An
    /// unavailable abstract namespace is not an error; it falls back to a
    /// filesystem socket.
    pub fn create() -> Result<Self> {
        if abstract_namespace_allowed() {
            match Self::create_abstract() {
                Ok(endpoint) => return Ok(endpoint),
                Err(err) => {
                    debug!(
                        error = %err,
                        "abstract namespace unavailable, falling back to filesystem socket"
                    );
                }
            }
        }
        Self::create_filesystem()
    }

    /// Binds under the abstract namespace, retrying on name collisions.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn create_abstract() -> Result<Self> {
        loop {
            let name = identity::generate_hex_id(UNIX_PATH_MAX - 2);
            let addr = UnixAddr::new_abstract(name.as_bytes())
                .map_err(|err| HandlerError::AbstractNamespaceUnavailable(errno_io(err)))?;
            match Self::bind_and_listen(&addr, &name) {
                Ok(listener) => {
                    return Ok(Self {
                        listener,
                        socket_name: name,
                        kind: SocketKind::Abstract,
                    });
                }
                Err(Errno::EADDRINUSE) => {
                    debug!(socket_name = %name, "abstract socket name in use, regenerating");
                }
                Err(err) => {
                    return Err(HandlerError::AbstractNamespaceUnavailable(errno_io(err)));
                }
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn create_abstract() -> Result<Self> {
        Err(HandlerError::AbstractNamespaceUnavailable(io::Error::from(
            io::ErrorKind::Unsupported,
        )))
    }

    /// Binds a filesystem socket under `/tmp`, retrying on collisions.
    fn create_filesystem() -> Result<Self> {
        loop {
            let mut name = format!("{SOCKET_PREFIX}{}", identity::generate_base64_id());
            name.truncate(UNIX_PATH_MAX - 1);
            let addr = UnixAddr::new(Path::new(&name)).map_err(errno_io)?;
            match Self::bind_and_listen(&addr, &name) {
                Ok(listener) => {
                    fs::set_permissions(&name, fs::Permissions::from_mode(0o600))?;
                    return Ok(Self {
                        listener,
                        socket_name: name,
                        kind: SocketKind::Filesystem,
                    });
                }
                Err(Errno::EADDRINUSE) => {
                    debug!(socket_name = %name, "socket path in use, regenerating");
                }
                Err(err) => return Err(errno_io(err).into()),
            }
        }
    }

    /// socket/bind/listen with the handler's fixed backlog.
    fn bind_and_listen(addr: &UnixAddr, name: &str) -> std::result::Result<StdUnixListener, Errno> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        socket::bind(fd.as_raw_fd(), addr)?;
        socket::listen(&fd, Backlog::new(BACKLOG_SIZE)?)?;

        let listener = StdUnixListener::from(fd);
        listener.set_nonblocking(true).map_err(|err| {
            debug!(socket_name = %name, error = %err, "failed to set listener nonblocking");
            err.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw)
        })?;
        Ok(listener)
    }

    /// The endpoint's name, without the leading NUL for abstract sockets.
    #[must_use]
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Which namespace the endpoint lives in.
    #[must_use]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Registers a duplicate of the listener with the current runtime.
    ///
    /// The endpoint itself stays usable for cleanup; the returned listener
    /// serves the accept loop. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated or
    /// registered with the runtime's reactor.
    pub fn register(&self) -> io::Result<UnixListener> {
        UnixListener::from_std(self.listener.try_clone()?)
    }

    /// Releases the descriptor; filesystem sockets are additionally
    /// unlinked, ignoring failures.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        if self.kind == SocketKind::Filesystem {
            let _ = fs::remove_file(&self.socket_name);
        }
    }
}

/// Opens a client connection to a handler endpoint.
///
/// For abstract sockets this prepends the single NUL the socket-name
/// contract strips from the exposed name.
///
/// # Errors
///
/// Returns the underlying connect error; abstract names on platforms
/// without an abstract namespace yield `Unsupported`.
pub async fn connect(socket_name: &str, kind: SocketKind) -> io::Result<UnixStream> {
    match kind {
        SocketKind::Filesystem => UnixStream::connect(socket_name).await,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SocketKind::Abstract => {
            use std::os::linux::net::SocketAddrExt;

            let addr = std::os::unix::net::SocketAddr::from_abstract_name(socket_name.as_bytes())?;
            let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            stream.set_nonblocking(true)?;
            UnixStream::from_std(stream)
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        SocketKind::Abstract => Err(io::Error::from(io::ErrorKind::Unsupported)),
    }
}

/// Whether the environment permits abstract-namespace sockets.
fn abstract_namespace_allowed() -> bool {
    std::env::var_os(NO_ABSTRACT_NAMESPACE_ENV).map_or(true, |value| value.is_empty())
}

fn errno_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use serial_test::serial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn filesystem_socket_has_prefix_and_owner_only_permissions() {
        let endpoint = SocketEndpoint::create_filesystem().unwrap();
        assert_eq!(endpoint.kind(), SocketKind::Filesystem);
        assert!(endpoint.socket_name().starts_with(SOCKET_PREFIX));
        assert!(endpoint.socket_name().len() < UNIX_PATH_MAX);

        let mode = fs::metadata(endpoint.socket_name()).unwrap().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn filesystem_socket_is_unlinked_on_close() {
        let endpoint = SocketEndpoint::create_filesystem().unwrap();
        let name = endpoint.socket_name().to_owned();
        assert!(Path::new(&name).exists());
        endpoint.close();
        assert!(!Path::new(&name).exists());
    }

    #[test]
    fn endpoints_get_distinct_names() {
        let a = SocketEndpoint::create_filesystem().unwrap();
        let b = SocketEndpoint::create_filesystem().unwrap();
        assert_ne!(a.socket_name(), b.socket_name());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abstract_socket_name_has_no_leading_nul() {
        let endpoint = SocketEndpoint::create_abstract().unwrap();
        assert_eq!(endpoint.kind(), SocketKind::Abstract);
        assert_eq!(endpoint.socket_name().len(), UNIX_PATH_MAX - 2);
        assert!(!endpoint.socket_name().starts_with('\0'));
    }

    #[test]
    #[serial]
    fn env_var_disables_abstract_namespace() {
        std::env::set_var(NO_ABSTRACT_NAMESPACE_ENV, "1");
        let endpoint = SocketEndpoint::create().unwrap();
        std::env::remove_var(NO_ABSTRACT_NAMESPACE_ENV);
        assert_eq!(endpoint.kind(), SocketKind::Filesystem);
    }

    #[tokio::test]
    async fn accept_and_connect_round_trip() {
        let endpoint = SocketEndpoint::create().unwrap();
        let listener = endpoint.register().unwrap();

        let mut client = connect(endpoint.socket_name(), endpoint.kind()).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.write_all(b"marco").await.unwrap();
        client.shutdown().await.unwrap();
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"marco");
    }
}
