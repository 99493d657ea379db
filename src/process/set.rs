//! The subprocess supervisor event loop.
//!
//! [`SubprocessSet`] runs a `ppoll` loop over the read pipes of every
//! running subprocess. All progress is driven by one thread calling
//! [`SubprocessSet::do_work`]; the only concurrent agents are the kernel's
//! signal delivery and the children themselves. Signals are blocked except
//! inside the wait, so there is exactly one suspension point per turn and
//! no lost-wakeup window.

use std::collections::VecDeque;

use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::WaitPidFlag;
use tracing::{debug, warn};

use super::signals::{self, SignalGuard};
use super::subprocess::{StreamKind, Subprocess, SubprocessId};
use crate::error::Result;

/// Supervises a set of running subprocesses and queues them as they finish.
///
/// Only one set may exist at a time: its signal handlers are process-wide.
#[derive(Debug)]
pub struct SubprocessSet {
    running: Vec<Subprocess>,
    /// Subprocesses that became done, in the order it happened, awaiting
    /// collection through [`SubprocessSet::next_finished`].
    finished: VecDeque<Subprocess>,
    signals: SignalGuard,
    next_id: u64,
}

impl SubprocessSet {
    /// Create the supervisor and install its signal handlers
    /// (SIGINT/SIGTERM/SIGHUP record an interrupt cause, SIGCHLD flags a
    /// pending reap). The previous dispositions are restored on drop.
    pub fn new() -> Result<SubprocessSet> {
        Ok(SubprocessSet {
            running: Vec::new(),
            finished: VecDeque::new(),
            signals: SignalGuard::install()?,
            next_id: 0,
        })
    }

    /// Launch `command` and retain the subprocess in the running set.
    ///
    /// Returns the new subprocess's stable id. A fatal spawn failure (e.g.
    /// `/bin/sh` missing) is returned as an error and leaves the set
    /// untouched.
    pub fn add(&mut self, command: &str, use_console: bool) -> Result<SubprocessId> {
        self.next_id += 1;
        let id = SubprocessId(self.next_id);
        let subprocess = Subprocess::spawn(id, command, use_console, self.signals.old_mask())?;
        self.running.push(subprocess);
        Ok(id)
    }

    /// Block until something happens: a pipe has data or closed, a child
    /// terminated, or an interrupt signal arrived.
    ///
    /// Returns `true` when woken by an interrupt - there is no subprocess
    /// progress to report and the caller should wind down. Otherwise
    /// services every ready pipe, reaps what the kernel has reported, moves
    /// newly done subprocesses to the finished queue and returns `false`.
    pub fn do_work(&mut self) -> Result<bool> {
        signals::clear_interrupt();

        // Fold in any reap request that raced the end of the previous turn:
        // the flag must be consumed before the wait resets it, or a
        // completion could be lost to the blocking call below.
        if signals::take_sigchld() {
            self.reap_terminated_children()?;
            if self.collect_done() {
                return Ok(false);
            }
        }

        // One pollfd per open pipe of every running subprocess, identified
        // by (running index, stream) rather than by pointer identity.
        let ready: Vec<(usize, StreamKind)> = {
            let mut targets: Vec<(usize, StreamKind)> = Vec::new();
            let mut pollfds: Vec<PollFd<'_>> = Vec::new();
            for (index, subprocess) in self.running.iter().enumerate() {
                for stream in [StreamKind::Stdout, StreamKind::Stderr] {
                    if let Some(fd) = subprocess.pipe_fd(stream) {
                        targets.push((index, stream));
                        pollfds.push(PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLPRI));
                    }
                }
            }

            // The one blocking call per turn. The pre-block mask is swapped
            // in atomically, so signals can only be delivered here.
            match ppoll(&mut pollfds, None, Some(*self.signals.old_mask())) {
                Ok(_) => targets
                    .iter()
                    .zip(pollfds.iter())
                    .filter(|(_, pollfd)| {
                        pollfd.revents().is_some_and(|revents| !revents.is_empty())
                    })
                    .map(|(target, _)| *target)
                    .collect(),
                Err(Errno::EINTR) => Vec::new(),
                Err(errno) => return Err(errno.into()),
            }
        };

        // A SIGCHLD may be the only wakeup for console subprocesses and for
        // children that closed their streams long before exiting.
        if signals::take_sigchld() {
            self.reap_terminated_children()?;
        }

        self.signals.handle_pending_interruption()?;
        if let Some(signal) = signals::interrupt_cause() {
            debug!(?signal, "event loop interrupted");
            return Ok(true);
        }

        for (index, stream) in ready {
            self.running[index].on_pipe_ready(stream)?;
        }

        // A stream closing usually means the child is gone or going; pick
        // up the exit status without blocking.
        for subprocess in &mut self.running {
            if subprocess.streams_closed() && subprocess.pid().is_some() {
                subprocess.try_finish(WaitPidFlag::WNOHANG)?;
            }
        }

        self.collect_done();
        Ok(false)
    }

    /// Move every done subprocess from the running set to the finished
    /// queue, preserving order. Returns whether anything moved.
    fn collect_done(&mut self) -> bool {
        let mut moved = false;
        let mut index = 0;
        while index < self.running.len() {
            if self.running[index].done() {
                let subprocess = self.running.remove(index);
                self.finished.push_back(subprocess);
                moved = true;
            } else {
                index += 1;
            }
        }
        moved
    }

    /// Non-blocking reap pass over every running subprocess, driven by a
    /// pending SIGCHLD.
    fn reap_terminated_children(&mut self) -> Result<()> {
        for subprocess in &mut self.running {
            if subprocess.pid().is_some() {
                subprocess.try_finish(WaitPidFlag::WNOHANG)?;
            }
        }
        Ok(())
    }

    /// Pop one finished subprocess, transferring ownership to the caller.
    /// Subprocesses come out in the order they became done, independent of
    /// the order their children exited.
    pub fn next_finished(&mut self) -> Option<Subprocess> {
        self.finished.pop_front()
    }

    /// The signal that interrupted the last [`SubprocessSet::do_work`], if
    /// any.
    pub fn interrupt_cause(&self) -> Option<Signal> {
        signals::interrupt_cause()
    }

    /// Number of subprocesses currently running.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Iterate over the running subprocesses, oldest first.
    pub fn running(&self) -> impl Iterator<Item = &Subprocess> {
        self.running.iter()
    }

    /// Tear down every running subprocess: deliver the interrupt cause
    /// (SIGTERM when none was recorded) to each non-console child's process
    /// group and release their resources. Pending output is discarded.
    /// Console children keep the terminal's own signal delivery.
    pub fn clear(&mut self) {
        let signal = signals::interrupt_cause().unwrap_or(Signal::SIGTERM);
        for subprocess in &self.running {
            if subprocess.use_console() {
                continue;
            }
            if let Some(pid) = subprocess.pid() {
                if let Err(errno) = killpg(pid, signal) {
                    warn!(pid = pid.as_raw(), ?signal, %errno, "failed to signal process group");
                }
            }
        }
        debug!(count = self.running.len(), ?signal, "cleared running subprocesses");
        self.running.clear();
    }
}

// SubprocessSet owns process-wide signal state, so its tests live in
// tests/subprocess.rs where every test serializes on one supervisor.
