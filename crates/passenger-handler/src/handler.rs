//! The request-handler main loop.
//!
//! A [`RequestHandler`] is the long-lived owner of one socket endpoint and
//! one application. Its main loop installs the signal discipline, waits on
//! the lifecycle monitor, accepts one connection at a time, decodes one
//! framed request per connection, and drives the application callback —
//! then transitions running → draining → exited on the first lifecycle
//! event that asks for it.
//!
//! # State machine
//!
//! ```text
//!  Init → Running → Draining → Exited
//!            │          ▲
//!            └──────────┘   soft termination / memory ceiling
//!            │
//!            └──→ Exited     hard termination / parent gone / interrupt
//! ```
//!
//! # Invariants
//!
//! - `iterations` increments at the top of every loop turn, strictly
//!   before the accept; `processed_requests` increments strictly after the
//!   client close, once per accepted connection regardless of outcome.
//! - Every loop exit path closes both ends of the graceful-termination
//!   pipe, restores the recorded signal dispositions, and broadcasts on
//!   the running condition variable.
//! - Requests are served strictly sequentially; the only concurrency is
//!   asynchronous signal delivery and an optional supervising thread
//!   calling [`RequestHandler::cleanup`].

use std::borrow::Cow;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, pipe};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{Application, ClientStream};
use crate::endpoint::{SocketEndpoint, SocketKind};
use crate::error::{HandlerError, Result};
use crate::frame::{self, RequestBody};
use crate::memory;
use crate::monitor::{GracefulPipe, LifecycleEvent, LifecycleMonitor};
use crate::signals::{HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL, SignalPlumbing};
use crate::watchdog::Watchdog;

/// Upper bound on a single request, application callback included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on the graceful-termination drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction-time options for a [`RequestHandler`].
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Resident-memory ceiling in bytes; 0 disables the check.
    pub memory_limit: u64,
    /// Signal that exits the loop immediately.
    pub hard_termination_signal: Signal,
    /// Signal that drains the in-flight request, then exits.
    pub soft_termination_signal: Signal,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            hard_termination_signal: HARD_TERMINATION_SIGNAL,
            soft_termination_signal: SOFT_TERMINATION_SIGNAL,
        }
    }
}

impl HandlerOptions {
    /// Default options: unlimited memory, `SIGTERM`/`SIGUSR1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the resident-memory ceiling in bytes.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Overrides the hard-termination signal.
    #[must_use]
    pub const fn with_hard_termination_signal(mut self, signal: Signal) -> Self {
        self.hard_termination_signal = signal;
        self
    }

    /// Overrides the soft-termination signal.
    #[must_use]
    pub const fn with_soft_termination_signal(mut self, signal: Signal) -> Self {
        self.soft_termination_signal = signal;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    Idle,
    Running,
    Finished,
}

/// I/O owned by the handler and released by `cleanup`.
struct LoopIo {
    endpoint: SocketEndpoint,
    owner_pipe: OwnedFd,
}

/// The per-worker request handler.
///
/// Constructed with the read end of the owner pipe (EOF there means the
/// parent web server died) and the embedded application. Mutated only by
/// its own main-loop thread; [`RequestHandler::cleanup`] may be invoked
/// from any thread and is idempotent.
pub struct RequestHandler<A> {
    app: A,
    options: HandlerOptions,
    socket_name: String,
    socket_kind: SocketKind,
    io: Mutex<Option<LoopIo>>,
    drain_watchdog: Mutex<Option<Watchdog>>,
    iterations: AtomicU64,
    processed_requests: AtomicU64,
    phase: Mutex<LoopPhase>,
    phase_changed: Condvar,
    shutdown: CancellationToken,
    loop_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<A: Application> RequestHandler<A> {
    /// Creates a handler: binds a private endpoint and adopts the owner
    /// pipe.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint cannot be created or the owner
    /// pipe cannot be configured.
    pub fn new(owner_pipe: OwnedFd, app: A, options: HandlerOptions) -> Result<Self> {
        set_nonblocking(&owner_pipe)?;
        let endpoint = SocketEndpoint::create()?;
        Ok(Self {
            app,
            options,
            socket_name: endpoint.socket_name().to_owned(),
            socket_kind: endpoint.kind(),
            io: Mutex::new(Some(LoopIo {
                endpoint,
                owner_pipe,
            })),
            drain_watchdog: Mutex::new(None),
            iterations: AtomicU64::new(0),
            processed_requests: AtomicU64::new(0),
            phase: Mutex::new(LoopPhase::Idle),
            phase_changed: Condvar::new(),
            shutdown: CancellationToken::new(),
            loop_thread: Mutex::new(None),
        })
    }

    /// The endpoint's name, NUL-free even for abstract sockets.
    ///
    /// The spawning process discloses this out of band; abstract names
    /// need a single NUL prepended when connecting.
    #[must_use]
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Which namespace the endpoint lives in.
    #[must_use]
    pub fn socket_kind(&self) -> SocketKind {
        self.socket_kind
    }

    /// Loop turns so far. One increment per turn, before the accept.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Fully handled requests so far, independent of application outcome.
    #[must_use]
    pub fn processed_requests(&self) -> u64 {
        self.processed_requests.load(Ordering::SeqCst)
    }

    /// Whether the main loop is currently accepting.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase
            .lock()
            .map_or(false, |phase| *phase == LoopPhase::Running)
    }

    /// Runs the main loop on the current task until a lifecycle event
    /// ends it.
    ///
    /// # Errors
    ///
    /// Returns an error only for setup failures (signal installation, pipe
    /// creation, or a handler that was already cleaned up). Per-request
    /// errors are absorbed at the iteration boundary.
    pub async fn main_loop(&self) -> Result<()> {
        let (listener, owner_pipe) = self.register_loop_io()?;
        let signals = SignalPlumbing::install(
            self.options.hard_termination_signal,
            self.options.soft_termination_signal,
        )?;
        let graceful = GracefulPipe::open()?;

        self.set_phase(LoopPhase::Running);
        info!(
            socket_name = %self.socket_name,
            socket_kind = %self.socket_kind,
            "request handler entering main loop"
        );

        self.run(&listener, &owner_pipe, &signals, &graceful).await;

        if let Ok(mut watchdog) = self.drain_watchdog.lock() {
            watchdog.take();
        }
        drop(graceful);
        signals.uninstall();
        self.set_phase(LoopPhase::Finished);
        info!("request handler left main loop");
        Ok(())
    }

    /// Spawns the main loop on a background thread with its own runtime
    /// and blocks until the running flag is broadcast.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be spawned.
    pub fn start_main_loop_thread(self: &Arc<Self>) -> io::Result<()> {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase == LoopPhase::Finished {
                *phase = LoopPhase::Idle;
            }
        }

        let handler = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("request-handler".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                match runtime {
                    Ok(runtime) => {
                        if let Err(err) = runtime.block_on(handler.main_loop()) {
                            error!(component = "request handler", error = %err, "main loop failed");
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "failed to build main-loop runtime");
                    }
                }
                // Covers setup-error exits that never reached Running.
                handler.set_phase(LoopPhase::Finished);
            })?;

        if let Ok(mut slot) = self.loop_thread.lock() {
            *slot = Some(thread);
        }
        self.wait_until_started();
        Ok(())
    }

    /// Unwinds the handler from any thread: interrupts the loop, joins its
    /// thread, disarms the termination watchdog, and releases the endpoint
    /// and owner pipe (unlinking a filesystem socket).
    ///
    /// Idempotent; the second call is a no-op.
    pub fn cleanup(&self) {
        self.shutdown.cancel();
        let thread = self.loop_thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        if let Ok(mut watchdog) = self.drain_watchdog.lock() {
            watchdog.take();
        }
        if let Ok(mut io) = self.io.lock() {
            io.take();
        }
    }

    /// Duplicates the loop's descriptors and registers them with the
    /// current runtime, leaving the originals for `cleanup`.
    fn register_loop_io(&self) -> Result<(tokio::net::UnixListener, pipe::Receiver)> {
        let guard = self.io.lock().map_err(|_| HandlerError::Closed)?;
        let io = guard.as_ref().ok_or(HandlerError::Closed)?;
        let listener = io.endpoint.register()?;
        let owner_pipe = pipe::Receiver::from_owned_fd(io.owner_pipe.try_clone()?)?;
        Ok((listener, owner_pipe))
    }

    async fn run(
        &self,
        listener: &tokio::net::UnixListener,
        owner_pipe: &pipe::Receiver,
        signals: &SignalPlumbing,
        graceful: &GracefulPipe,
    ) {
        let monitor = LifecycleMonitor {
            listener,
            owner_pipe,
            signals,
            graceful,
            shutdown: &self.shutdown,
            hard: self.options.hard_termination_signal,
            soft: self.options.soft_termination_signal,
        };

        loop {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            match monitor.wait().await {
                LifecycleEvent::Connection(stream) => {
                    self.serve_connection(stream, signals).await;
                    self.processed_requests.fetch_add(1, Ordering::SeqCst);
                    self.enforce_memory_ceiling(graceful);
                }
                LifecycleEvent::SoftTermination => {
                    self.initiate_drain(graceful, "soft-termination signal");
                }
                LifecycleEvent::Abort => {
                    let err = HandlerError::Signal("SIGABRT");
                    error!(
                        component = "request handler",
                        error = %err,
                        "abort received between requests"
                    );
                }
                LifecycleEvent::HardTermination => {
                    info!("hard-termination signal, exiting main loop");
                    break;
                }
                LifecycleEvent::ParentGone => {
                    info!("owner pipe closed, exiting main loop");
                    break;
                }
                LifecycleEvent::Drained => {
                    info!("graceful termination complete");
                    break;
                }
                LifecycleEvent::Interrupted => {
                    debug!("main loop interrupted");
                    break;
                }
            }
        }
    }

    /// Serves one accepted connection and always closes it afterwards.
    async fn serve_connection(&self, stream: UnixStream, signals: &SignalPlumbing) {
        let (read_half, mut write_half) = stream.into_split();
        if let Err(err) = self.serve_request(read_half, &mut write_half, signals).await {
            if err.is_transient() {
                warn!(component = "request handler", error = %err, "aborting request");
            } else {
                error!(component = "request handler", error = %err, "request failed");
            }
        }
        let _ = write_half.shutdown().await;
    }

    /// Decodes one request and dispatches it under a per-request watchdog.
    ///
    /// The application callback races an abort watch: `SIGABRT` delivered
    /// mid-dispatch fails this request synchronously. Termination signals
    /// arriving meanwhile are deferred to the next monitor wait, so the
    /// in-flight request completes first.
    async fn serve_request(
        &self,
        read_half: OwnedReadHalf,
        client: &mut ClientStream,
        signals: &SignalPlumbing,
    ) -> Result<()> {
        let mut reader = read_half;
        let Some(headers) = frame::read_request(&mut reader).await? else {
            return Ok(());
        };

        let server_name = headers.get_str("SERVER_NAME").unwrap_or(Cow::Borrowed(""));
        let request_uri = headers.get_str("REQUEST_URI").unwrap_or(Cow::Borrowed(""));
        let diagnostic = format!("{server_name}/{request_uri}");
        let watchdog = Watchdog::arm(REQUEST_TIMEOUT, Signal::SIGKILL, Some(diagnostic));

        let mut body = RequestBody::new(reader, &headers);
        let outcome = tokio::select! {
            outcome = self.app.handle(&headers, &mut body, client) => {
                outcome.map_err(HandlerError::from)
            }
            aborted = signals.recv_abort() => match aborted {
                Ok(()) => Err(HandlerError::Signal("SIGABRT")),
                Err(err) => Err(err.into()),
            },
        };
        watchdog.disarm();
        outcome
    }

    fn enforce_memory_ceiling(&self, graceful: &GracefulPipe) {
        let limit = self.options.memory_limit;
        if limit == 0 {
            return;
        }
        let resident = memory::resident_set_size();
        if resident > limit {
            info!(
                resident_bytes = resident,
                limit_bytes = limit,
                "memory ceiling exceeded"
            );
            self.initiate_drain(graceful, "memory ceiling");
        }
    }

    /// Closes the graceful pipe's write end and arms the termination
    /// watchdog, once.
    fn initiate_drain(&self, graceful: &GracefulPipe, reason: &str) {
        if graceful.close_write_end() {
            info!(reason, "entering graceful termination");
        }
        let Ok(mut watchdog) = self.drain_watchdog.lock() else {
            return;
        };
        if watchdog.is_none() {
            *watchdog = Some(Watchdog::arm(
                DRAIN_TIMEOUT,
                Signal::SIGKILL,
                Some("graceful termination".into()),
            ));
        }
    }

    fn set_phase(&self, phase: LoopPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
        self.phase_changed.notify_all();
    }

    /// Blocks until the loop broadcast that it started (or already ended).
    fn wait_until_started(&self) {
        let Ok(mut phase) = self.phase.lock() else {
            return;
        };
        while *phase == LoopPhase::Idle {
            match self.phase_changed.wait(phase) {
                Ok(next) => phase = next,
                Err(_) => return,
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
