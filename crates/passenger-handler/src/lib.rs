//! Per-worker request handler core.
//!
//! This crate implements the long-lived worker side of an application
//! server: a single process that owns one application instance, listens on
//! a private Unix-domain socket, decodes a CGI-style framed request
//! protocol, drives the application callback, and terminates cleanly (hard
//! or graceful) on a well-defined lifecycle signal set or when its parent
//! web server disappears.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Application callback              │  app
//! ├─────────────────────────────────────────┤
//! │        Request handler main loop         │  handler
//! ├────────────┬──────────────┬─────────────┤
//! │  Lifecycle │   Framed     │  Watchdogs  │  monitor / frame / watchdog
//! │  monitor   │   decoder    │             │
//! ├────────────┴──────────────┴─────────────┤
//! │        Private socket endpoint           │  endpoint / identity
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`app`]: the [`Application`] callback contract and the
//!   [`passenger_header`] identification string
//! - [`endpoint`]: private Unix-domain listening endpoint (abstract
//!   namespace preferred, filesystem fallback)
//! - [`error`]: error taxonomy ([`HandlerError`], [`Result`])
//! - [`frame`]: length-prefixed, NUL-separated request metadata codec
//! - [`handler`]: the [`RequestHandler`] main loop and its lifecycle
//! - [`identity`]: cryptographically strong socket-name identities
//! - [`watchdog`]: scoped timers that signal this process on expiry
//!
//! The readiness multiplexer and the signal discipline are internal to the
//! main loop and have no public surface.
//!
//! # Lifecycle
//!
//! A handler is constructed from the read end of an owner pipe whose write
//! end stays in the parent; EOF on that pipe means the parent is gone. The
//! main loop accepts one connection at a time, serves it to completion, and
//! consults the lifecycle monitor between requests. `SIGUSR1` (or a
//! configured soft-termination signal) drains the in-flight request before
//! exiting; `SIGTERM` and parent death exit at the next loop turn.
//!
//! # Security Considerations
//!
//! - Socket names carry 512 bits of OS entropy
//! - Filesystem sockets are created with mode 0600 and unlinked on cleanup
//! - Request metadata length is validated before allocation

pub mod app;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handler;
pub mod identity;
pub mod watchdog;

mod memory;
mod monitor;
mod signals;

pub use app::{Application, BodyStream, ClientStream, passenger_header};
pub use endpoint::{BACKLOG_SIZE, NO_ABSTRACT_NAMESPACE_ENV, SocketEndpoint, SocketKind, connect};
pub use error::{HandlerError, Result};
pub use frame::{MAX_HEADER_SIZE, RequestBody, RequestHeaders, read_request, write_request};
pub use handler::{DRAIN_TIMEOUT, HandlerOptions, REQUEST_TIMEOUT, RequestHandler};
pub use identity::UNIX_PATH_MAX;
pub use signals::{HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL};
pub use watchdog::Watchdog;
