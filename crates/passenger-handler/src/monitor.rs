//! Readiness multiplexer gating the accept loop.
//!
//! The monitor performs one wait over every source that can wake the main
//! loop and reports the first that becomes ready. Cancellation priority:
//! the cleanup interrupt, then hard termination, then owner-pipe EOF,
//! then soft termination and the graceful-termination pipe, and finally
//! the listener. A soft-termination byte that arrives together with
//! owner-pipe EOF loses the tie: a worker whose parent is gone exits now
//! instead of draining.
//!
//! The owner pipe carries no data, ever; readability there is EOF and
//! means the parent web server is gone. The graceful-termination pipe is
//! equally silent: its write end being closed is the wake-up.

use std::os::fd::OwnedFd;
use std::sync::Mutex;

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::pipe2;
use tokio::net::{UnixListener, UnixStream, unix::pipe};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::signals::SignalPlumbing;

/// One outcome of a monitor wait.
#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    /// A client connected; serve one request.
    Connection(UnixStream),
    /// `cleanup` interrupted the loop from another thread.
    Interrupted,
    /// Hard-termination signal: exit without draining.
    HardTermination,
    /// Soft-termination signal: drain, then exit.
    SoftTermination,
    /// `SIGABRT`, translated into a synchronous failure.
    Abort,
    /// EOF on the owner pipe: the parent is gone.
    ParentGone,
    /// The graceful-termination pipe was closed; no further requests.
    Drained,
}

/// Wake-up channel for graceful termination.
///
/// Created once per `main_loop` invocation. Closing the write end (from
/// the soft-termination path or the memory-ceiling check) wakes the
/// monitor on its next wait; both ends are closed when the loop exits and
/// drops the pipe.
pub(crate) struct GracefulPipe {
    reader: pipe::Receiver,
    writer: Mutex<Option<OwnedFd>>,
}

impl GracefulPipe {
    /// Opens the pipe. Must be called from within a tokio runtime.
    pub(crate) fn open() -> Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
        Ok(Self {
            reader: pipe::Receiver::from_owned_fd(read_end)?,
            writer: Mutex::new(Some(write_end)),
        })
    }

    /// Closes the write end. Returns true the first time, false after.
    pub(crate) fn close_write_end(&self) -> bool {
        self.writer
            .lock()
            .map(|mut writer| writer.take().is_some())
            .unwrap_or(false)
    }

    /// Resolves once the write end has been closed.
    pub(crate) async fn closed(&self) {
        // Nothing is ever written, so readability can only mean EOF.
        let _ = self.reader.readable().await;
    }
}

/// Borrowed view over the loop's wait sources.
pub(crate) struct LifecycleMonitor<'a> {
    pub(crate) listener: &'a UnixListener,
    pub(crate) owner_pipe: &'a pipe::Receiver,
    pub(crate) signals: &'a SignalPlumbing,
    pub(crate) graceful: &'a GracefulPipe,
    pub(crate) shutdown: &'a CancellationToken,
    pub(crate) hard: Signal,
    pub(crate) soft: Signal,
}

impl LifecycleMonitor<'_> {
    /// Waits for the first ready source.
    ///
    /// Transient accept failures and unexpected signal bytes are logged
    /// and absorbed; the wait simply continues.
    pub(crate) async fn wait(&self) -> LifecycleEvent {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return LifecycleEvent::Interrupted,
                signal = self.signals.recv() => match signal {
                    Ok(signal) if signal == self.hard => return LifecycleEvent::HardTermination,
                    Ok(signal) if signal == self.soft => {
                        // Owner-pipe EOF outranks a soft-termination
                        // request that landed in the same wait.
                        if self.owner_pipe_gone() {
                            return LifecycleEvent::ParentGone;
                        }
                        return LifecycleEvent::SoftTermination;
                    }
                    Ok(Signal::SIGABRT) => return LifecycleEvent::Abort,
                    Ok(signal) => {
                        warn!(signal = %signal, "unexpected signal on lifecycle pipe");
                    }
                    Err(err) => {
                        warn!(error = %err, "lifecycle signal pipe failed");
                        return LifecycleEvent::Interrupted;
                    }
                },
                _ = self.owner_pipe.readable() => return LifecycleEvent::ParentGone,
                () = self.graceful.closed() => return LifecycleEvent::Drained,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => return LifecycleEvent::Connection(stream),
                    Err(err) => {
                        warn!(component = "request handler", error = %err, "accept failed");
                    }
                },
            }
        }
    }

    /// Nonblocking probe for owner-pipe EOF. Any readability counts: the
    /// parent never writes, so a readable owner pipe is a dead parent.
    fn owner_pipe_gone(&self) -> bool {
        let mut probe = [0u8; 1];
        self.owner_pipe.try_read(&mut probe).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn graceful_pipe_wakes_only_after_write_end_closes() {
        let pipe = GracefulPipe::open().unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), pipe.closed()).await;
        assert!(pending.is_err(), "closed() resolved while the write end was open");

        assert!(pipe.close_write_end());
        tokio::time::timeout(Duration::from_secs(1), pipe.closed())
            .await
            .expect("closed() did not resolve after the write end was dropped");
    }

    #[tokio::test]
    async fn write_end_closes_exactly_once() {
        let pipe = GracefulPipe::open().unwrap();
        assert!(pipe.close_write_end());
        assert!(!pipe.close_write_end());
    }
}
