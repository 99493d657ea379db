//! Process-wide signal state for the subprocess supervisor.
//!
//! The kernel delivers signals process-wide, so this state is necessarily
//! global: handlers record the interrupting signal (or a pending-SIGCHLD
//! flag) into atomics and the `ppoll` wait in the event loop is the only
//! place where the signals are unblocked. [`SignalGuard`] installs the
//! handlers and the blocking mask, and restores the previous dispositions on
//! drop. Exactly one guard may be alive at a time.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use tracing::debug;

use crate::error::{BexError, Result};

/// Signal number that caused the interruption, 0 when none.
static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Set by the SIGCHLD handler when a child terminates; consumed by the
/// event loop to trigger non-blocking reaping.
static SIGCHLD_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Whether a [`SignalGuard`] is currently alive.
static GUARD_ACTIVE: AtomicBool = AtomicBool::new(false);

extern "C" fn record_interrupt(signum: libc::c_int) {
    INTERRUPT_SIGNAL.store(signum, Ordering::Relaxed);
}

extern "C" fn record_sigchld(_signum: libc::c_int) {
    SIGCHLD_RECEIVED.store(true, Ordering::Relaxed);
}

/// Reset the recorded interrupt cause. Called at the top of every event-loop
/// turn.
pub(crate) fn clear_interrupt() {
    INTERRUPT_SIGNAL.store(0, Ordering::Relaxed);
}

/// The signal that interrupted the build, if any.
pub(crate) fn interrupt_cause() -> Option<Signal> {
    match INTERRUPT_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        signum => Signal::try_from(signum).ok(),
    }
}

/// Consume the pending-SIGCHLD flag.
pub(crate) fn take_sigchld() -> bool {
    SIGCHLD_RECEIVED.swap(false, Ordering::Relaxed)
}

pub(crate) fn clear_sigchld() {
    SIGCHLD_RECEIVED.store(false, Ordering::Relaxed);
}

/// Installs the supervisor's signal handlers and blocking mask; restores
/// everything on drop.
#[derive(Debug)]
pub(crate) struct SignalGuard {
    /// The signal mask in effect before construction. Children are spawned
    /// with this mask and `ppoll` atomically swaps to it while waiting.
    old_mask: SigSet,
    old_actions: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    /// Block SIGINT/SIGTERM/SIGHUP/SIGCHLD and install the recording
    /// handlers. Fails with [`BexError::SupervisorActive`] when another
    /// guard is alive: handler state is process-wide and supports exactly
    /// one consumer.
    pub(crate) fn install() -> Result<SignalGuard> {
        if GUARD_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(BexError::SupervisorActive);
        }
        Self::install_handlers().inspect_err(|_| {
            GUARD_ACTIVE.store(false, Ordering::SeqCst);
        })
    }

    fn install_handlers() -> Result<SignalGuard> {
        clear_interrupt();
        clear_sigchld();

        let mut blocked = SigSet::empty();
        for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGCHLD] {
            blocked.add(signal);
        }
        let mut old_mask = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut old_mask))?;

        let interrupt_action = SigAction::new(
            SigHandler::Handler(record_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SA_NOCLDSTOP: only child termination should wake the event loop,
        // not job-control stops.
        let sigchld_action = SigAction::new(
            SigHandler::Handler(record_sigchld),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );

        let mut old_actions = Vec::with_capacity(4);
        for (signal, action) in [
            (Signal::SIGINT, &interrupt_action),
            (Signal::SIGTERM, &interrupt_action),
            (Signal::SIGHUP, &interrupt_action),
            (Signal::SIGCHLD, &sigchld_action),
        ] {
            // SAFETY: both handlers only store into atomics, which is
            // async-signal-safe.
            let old = unsafe { signal::sigaction(signal, action) }?;
            old_actions.push((signal, old));
        }

        debug!("installed supervisor signal handlers");
        Ok(SignalGuard {
            old_mask,
            old_actions,
        })
    }

    /// The pre-block signal mask, for `ppoll` and child spawning.
    pub(crate) fn old_mask(&self) -> &SigSet {
        &self.old_mask
    }

    /// Fold interrupt signals that arrived while blocked (outside `ppoll`)
    /// into the recorded cause. They sit in the pending set because the
    /// supervisor only unblocks them during the wait.
    pub(crate) fn handle_pending_interruption(&self) -> Result<()> {
        let mut pending = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset/sigpending initialize the set; sigismember
        // only reads it afterwards.
        unsafe {
            if libc::sigemptyset(pending.as_mut_ptr()) != 0
                || libc::sigpending(pending.as_mut_ptr()) != 0
            {
                return Err(BexError::Io(std::io::Error::last_os_error()));
            }
            let pending = pending.assume_init();
            for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
                if libc::sigismember(&pending, signal as libc::c_int) == 1 {
                    INTERRUPT_SIGNAL.store(signal as i32, Ordering::Relaxed);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (signal, action) in &self.old_actions {
            // SAFETY: restoring dispositions saved at install time.
            let _ = unsafe { signal::sigaction(*signal, action) };
        }
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None);
        GUARD_ACTIVE.store(false, Ordering::SeqCst);
        debug!("restored previous signal dispositions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The state under test is process-global, so these tests cannot run
    /// concurrently with each other.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn test_single_guard_at_a_time() {
        let _serial = SERIAL.lock().unwrap();

        let guard = SignalGuard::install().unwrap();
        let err = SignalGuard::install().unwrap_err();
        assert!(matches!(err, BexError::SupervisorActive));

        drop(guard);
        let guard = SignalGuard::install().unwrap();
        drop(guard);
    }

    #[test]
    fn test_interrupt_cause_round_trip() {
        let _serial = SERIAL.lock().unwrap();

        clear_interrupt();
        assert!(interrupt_cause().is_none());

        record_interrupt(libc::SIGTERM);
        assert_eq!(interrupt_cause(), Some(Signal::SIGTERM));

        clear_interrupt();
        assert!(interrupt_cause().is_none());
    }

    #[test]
    fn test_sigchld_flag_is_consumed_once() {
        let _serial = SERIAL.lock().unwrap();

        clear_sigchld();
        assert!(!take_sigchld());

        record_sigchld(libc::SIGCHLD);
        assert!(take_sigchld());
        assert!(!take_sigchld());
    }
}
