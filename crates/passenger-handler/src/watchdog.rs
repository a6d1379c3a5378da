//! Scoped timers that signal this process on expiry.
//!
//! A watchdog is armed with a timeout and a signal; if it is not disarmed
//! before the timeout elapses, it delivers the signal to **this** process.
//! Disarming happens explicitly or when the guard is dropped, so a
//! watchdog wrapped around a scope can never outlive it.
//!
//! The timer runs on its own OS thread rather than the handler's runtime:
//! the per-request watchdog exists precisely for requests that wedge the
//! loop thread inside the application callback, where a runtime-scheduled
//! timer would never get polled.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{error, warn};

/// A one-shot timer guard.
///
/// Cancellation may race the firing timer; the race is benign, because the
/// timer re-checks the disarmed flag after its wait ends.
#[derive(Debug)]
pub struct Watchdog {
    state: Arc<WatchdogState>,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct WatchdogState {
    disarmed: Mutex<bool>,
    condvar: Condvar,
}

impl Watchdog {
    /// Arms a timer that sends `signal` to this process after `timeout`,
    /// unless disarmed first. `note` is logged on expiry for post-mortem
    /// diagnostics.
    ///
    /// A watchdog whose timer thread cannot be spawned is inert; the
    /// failure is logged and the guarded scope runs unbounded.
    #[must_use]
    pub fn arm(timeout: Duration, signal: Signal, note: Option<String>) -> Self {
        let state = Arc::new(WatchdogState {
            disarmed: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let timer_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || Self::run(&timer_state, timeout, signal, note));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to spawn watchdog timer thread");
                None
            }
        };
        Self { state, thread }
    }

    fn run(state: &WatchdogState, timeout: Duration, signal: Signal, note: Option<String>) {
        let Ok(guard) = state.disarmed.lock() else {
            return;
        };
        let Ok((guard, result)) = state
            .condvar
            .wait_timeout_while(guard, timeout, |disarmed| !*disarmed)
        else {
            return;
        };
        if result.timed_out() && !*guard {
            drop(guard);
            match &note {
                Some(note) => error!(
                    request = %note,
                    signal = %signal,
                    timeout_secs = timeout.as_secs(),
                    "watchdog expired, signalling own process"
                ),
                None => error!(
                    signal = %signal,
                    timeout_secs = timeout.as_secs(),
                    "watchdog expired, signalling own process"
                ),
            }
            let _ = kill(Pid::this(), signal);
        }
    }

    /// Cancels the timer. Equivalent to dropping the guard.
    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Ok(mut disarmed) = self.state.disarmed.lock() {
            *disarmed = true;
        }
        self.state.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, sigaction};
    use serial_test::serial;

    use super::*;

    static FIRED: AtomicBool = AtomicBool::new(false);

    extern "C" fn record_fire(_: libc::c_int) {
        FIRED.store(true, Ordering::SeqCst);
    }

    fn with_recording_handler(test: impl FnOnce()) {
        FIRED.store(false, Ordering::SeqCst);
        let recording = SigAction::new(
            SigHandler::Handler(record_fire),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(Signal::SIGUSR2, &recording) }.unwrap();
        test();
        let _ = unsafe { sigaction(Signal::SIGUSR2, &previous) };
    }

    #[test]
    #[serial]
    fn expired_watchdog_signals_this_process() {
        with_recording_handler(|| {
            let _watchdog = Watchdog::arm(
                Duration::from_millis(50),
                Signal::SIGUSR2,
                Some("test/watchdog".into()),
            );
            for _ in 0..40 {
                if FIRED.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
            assert!(FIRED.load(Ordering::SeqCst));
        });
    }

    #[test]
    #[serial]
    fn disarm_cancels_the_timer() {
        with_recording_handler(|| {
            let watchdog = Watchdog::arm(Duration::from_millis(100), Signal::SIGUSR2, None);
            watchdog.disarm();
            thread::sleep(Duration::from_millis(300));
            assert!(!FIRED.load(Ordering::SeqCst));
        });
    }

    #[test]
    #[serial]
    fn drop_while_timer_is_due_is_safe() {
        with_recording_handler(|| {
            let watchdog = Watchdog::arm(Duration::from_millis(1), Signal::SIGUSR2, None);
            thread::sleep(Duration::from_millis(20));
            drop(watchdog);
        });
    }
}
