//! Signal discipline for the main loop.
//!
//! On loop entry every trappable signal is reset to its default
//! disposition, remembering the prior one; on loop exit the remembered
//! dispositions are reinstalled. While the loop runs, the lifecycle
//! signals are fanned into a self-pipe: the handler writes the signal
//! number as a single byte, and the lifecycle monitor reads those bytes as
//! ordinary readiness events alongside the owner pipe and the listener.
//!
//! Dispositions while the loop runs:
//!
//! - `SIGHUP`: ignored
//! - `SIGABRT`: forwarded, surfaced as a synchronous request failure
//! - hard-termination signal (default `SIGTERM`): forwarded, exits the loop
//!   immediately
//! - soft-termination signal (default `SIGUSR1`): forwarded, drains the
//!   in-flight request first
//!
//! Only async-signal-safe operations happen inside the handler itself: a
//! single `write` to a nonblocking pipe.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;
use tokio::net::unix::pipe;

use crate::error::Result;

/// Signal requesting an immediate exit from the loop.
pub const HARD_TERMINATION_SIGNAL: Signal = Signal::SIGTERM;

/// Signal requesting a graceful drain: finish the current request, then
/// exit.
pub const SOFT_TERMINATION_SIGNAL: Signal = Signal::SIGUSR1;

/// Write end of the self-pipe, or -1 while no loop is running.
static FORWARD_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = FORWARD_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        let _ = unsafe { libc::write(fd, std::ptr::addr_of!(byte).cast(), 1) };
    }
}

/// Signal dispositions recorded at loop entry.
pub(crate) struct SavedDispositions {
    saved: Vec<(Signal, SigAction)>,
}

/// Resets every trappable signal to its default disposition, remembering
/// the prior one. Untrappable signals are skipped silently.
pub(crate) fn capture_and_reset() -> SavedDispositions {
    let default_action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let mut saved = Vec::new();
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        if let Ok(previous) = unsafe { sigaction(signal, &default_action) } {
            saved.push((signal, previous));
        }
    }
    SavedDispositions { saved }
}

impl SavedDispositions {
    /// Reinstalls every remembered disposition.
    pub(crate) fn restore(&self) {
        for (signal, action) in &self.saved {
            let _ = unsafe { sigaction(*signal, action) };
        }
    }
}

/// The loop's installed signal state: saved dispositions plus the
/// self-pipe the lifecycle signals are forwarded into.
///
/// Dropping (or explicitly uninstalling) tears the pipe out of the handler
/// and restores the recorded dispositions, on every loop-exit path.
pub(crate) struct SignalPlumbing {
    receiver: pipe::Receiver,
    write_end: Option<OwnedFd>,
    saved: Option<SavedDispositions>,
    /// Signals consumed by the in-request abort watch but owed to the
    /// lifecycle monitor. Drained FIFO by [`SignalPlumbing::recv`].
    deferred: Mutex<VecDeque<Signal>>,
}

impl SignalPlumbing {
    /// Captures and resets dispositions, then installs the loop's own
    /// handlers. Must be called from within a tokio runtime.
    ///
    /// A partial installation failure restores the captured dispositions
    /// before reporting the error.
    pub(crate) fn install(hard: Signal, soft: Signal) -> Result<Self> {
        let saved = capture_and_reset();
        match Self::install_handlers(hard, soft) {
            Ok((receiver, write_end)) => Ok(Self {
                receiver,
                write_end: Some(write_end),
                saved: Some(saved),
                deferred: Mutex::new(VecDeque::new()),
            }),
            Err(err) => {
                FORWARD_FD.store(-1, Ordering::SeqCst);
                saved.restore();
                Err(err)
            }
        }
    }

    fn install_handlers(hard: Signal, soft: Signal) -> Result<(pipe::Receiver, OwnedFd)> {
        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(errno_io)?;
        FORWARD_FD.store(write_end.as_raw_fd(), Ordering::SeqCst);

        let forward = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            sigaction(Signal::SIGHUP, &ignore).map_err(errno_io)?;
            sigaction(Signal::SIGABRT, &forward).map_err(errno_io)?;
            sigaction(hard, &forward).map_err(errno_io)?;
            sigaction(soft, &forward).map_err(errno_io)?;
        }

        let receiver = pipe::Receiver::from_owned_fd(read_end)?;
        Ok((receiver, write_end))
    }

    /// The next lifecycle signal delivered to this process.
    ///
    /// Signals deferred by [`SignalPlumbing::recv_abort`] are returned
    /// first, in delivery order. Cancel-safe: a signal is only taken out
    /// synchronously, never across an await point.
    pub(crate) async fn recv(&self) -> io::Result<Signal> {
        if let Some(signal) = self.pop_deferred() {
            return Ok(signal);
        }
        self.read_signal().await
    }

    /// Resolves only when `SIGABRT` is delivered.
    ///
    /// Raced against the application callback so an abort fails the
    /// in-flight request. Any other signal arriving meanwhile is deferred
    /// for the lifecycle monitor's next [`SignalPlumbing::recv`].
    pub(crate) async fn recv_abort(&self) -> io::Result<()> {
        loop {
            let signal = self.read_signal().await?;
            if signal == Signal::SIGABRT {
                return Ok(());
            }
            if let Ok(mut deferred) = self.deferred.lock() {
                deferred.push_back(signal);
            }
        }
    }

    fn pop_deferred(&self) -> Option<Signal> {
        self.deferred
            .lock()
            .ok()
            .and_then(|mut deferred| deferred.pop_front())
    }

    async fn read_signal(&self) -> io::Result<Signal> {
        loop {
            self.receiver.readable().await?;
            let mut byte = [0u8; 1];
            match self.receiver.try_read(&mut byte) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(_) => {
                    return Signal::try_from(i32::from(byte[0]))
                        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Restores the recorded dispositions and closes the self-pipe.
    pub(crate) fn uninstall(self) {
        drop(self);
    }
}

impl Drop for SignalPlumbing {
    fn drop(&mut self) {
        FORWARD_FD.store(-1, Ordering::SeqCst);
        self.write_end.take();
        if let Some(saved) = self.saved.take() {
            saved.restore();
        }
    }
}

fn errno_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::raise;
    use serial_test::serial;

    use super::*;

    extern "C" fn noop(_: libc::c_int) {}

    fn current_disposition(signal: Signal) -> SigAction {
        let probe = SigAction::new(SigHandler::Handler(noop), SaFlags::empty(), SigSet::empty());
        let previous = unsafe { sigaction(signal, &probe) }.unwrap();
        let _ = unsafe { sigaction(signal, &previous) };
        previous
    }

    #[test]
    #[serial]
    fn capture_resets_to_default_and_restore_brings_handlers_back() {
        let custom = SigAction::new(SigHandler::Handler(noop), SaFlags::empty(), SigSet::empty());
        let original = unsafe { sigaction(Signal::SIGUSR2, &custom) }.unwrap();

        let saved = capture_and_reset();
        assert_eq!(current_disposition(Signal::SIGUSR2).handler(), SigHandler::SigDfl);

        saved.restore();
        assert_eq!(
            current_disposition(Signal::SIGUSR2).handler(),
            SigHandler::Handler(noop)
        );

        let _ = unsafe { sigaction(Signal::SIGUSR2, &original) };
    }

    #[tokio::test]
    #[serial]
    async fn forwarded_signal_arrives_as_a_pipe_message() {
        let plumbing =
            SignalPlumbing::install(HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL).unwrap();

        raise(SOFT_TERMINATION_SIGNAL).unwrap();
        assert_eq!(plumbing.recv().await.unwrap(), SOFT_TERMINATION_SIGNAL);

        raise(Signal::SIGABRT).unwrap();
        assert_eq!(plumbing.recv().await.unwrap(), Signal::SIGABRT);

        plumbing.uninstall();
    }

    #[tokio::test]
    #[serial]
    async fn abort_watch_defers_other_signals_for_the_monitor() {
        let plumbing =
            SignalPlumbing::install(HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL).unwrap();

        raise(SOFT_TERMINATION_SIGNAL).unwrap();
        raise(Signal::SIGABRT).unwrap();

        plumbing.recv_abort().await.unwrap();
        assert_eq!(plumbing.recv().await.unwrap(), SOFT_TERMINATION_SIGNAL);

        plumbing.uninstall();
    }

    #[tokio::test]
    #[serial]
    async fn uninstall_restores_prior_dispositions() {
        let custom = SigAction::new(SigHandler::Handler(noop), SaFlags::empty(), SigSet::empty());
        let original = unsafe { sigaction(Signal::SIGUSR1, &custom) }.unwrap();

        let plumbing =
            SignalPlumbing::install(HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL).unwrap();
        plumbing.uninstall();

        assert_eq!(
            current_disposition(Signal::SIGUSR1).handler(),
            SigHandler::Handler(noop)
        );
        let _ = unsafe { sigaction(Signal::SIGUSR1, &original) };
    }
}
