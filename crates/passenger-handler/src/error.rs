//! Error taxonomy for the request handler.
//!
//! Everything below a watchdog kill is handled locally at the iteration
//! boundary of the main loop: transient connection errors and malformed
//! requests abandon the current request and the loop continues. Nothing is
//! retried by the handler; retry across workers is the web server's job.

use std::io;

use thiserror::Error;

use crate::frame::MAX_HEADER_SIZE;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Errors surfaced by the request handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The u32 metadata length prefix exceeds the hard limit. The client
    /// connection is aborted and the loop continues.
    #[error("request metadata length {0} exceeds the {MAX_HEADER_SIZE} byte limit")]
    MetadataTooLarge(u32),

    /// A metadata name or value handed to the encoder contains an embedded
    /// NUL, which the wire format cannot represent.
    #[error("request metadata field {0:?} contains an embedded NUL")]
    InvalidMetadata(String),

    /// Abstract-namespace sockets are not available on this host.
    /// The endpoint falls back to a filesystem socket.
    #[error("abstract namespace sockets unavailable")]
    AbstractNamespaceUnavailable(#[source] io::Error),

    /// A signal was translated into a synchronous failure (`SIGABRT`).
    /// Handled like a request failure, not a process death.
    #[error("received signal {0}")]
    Signal(&'static str),

    /// The handler's I/O resources were already released by `cleanup`.
    #[error("request handler has been cleaned up")]
    Closed,

    /// Transient connection-level I/O: broken pipes, unexpected client
    /// close, partial reads.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Whether this error abandons only the current request.
    ///
    /// Transient errors are logged with a component tag at the iteration
    /// boundary; the loop keeps serving.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MetadataTooLarge(_) | Self::InvalidMetadata(_) | Self::Signal(_) | Self::Io(_)
        )
    }
}
