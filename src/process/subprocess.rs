//! A single supervised child process.
//!
//! A [`Subprocess`] is entirely passive: the owning
//! [`SubprocessSet`](super::SubprocessSet) notifies it when one of its pipes
//! is ready and reaps it when the kernel reports an exit. Callers collect it
//! from the finished queue and call [`Subprocess::finish`] to obtain the
//! exit status.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use tracing::{debug, trace};

use crate::error::{BexError, Result};

/// Read chunk size for draining output pipes.
const PIPE_READ_CHUNK: usize = 4 << 10;

/// Final status of a supervised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child exited with status 0.
    Success,
    /// The child exited with the given non-zero status, or died on a signal
    /// outside the interruption path (reported with the shell convention
    /// `128 + signo`).
    Failure(i32),
    /// The child was terminated by the supervisor's interrupt propagation
    /// (SIGINT, SIGTERM or SIGHUP).
    Interrupted,
}

/// Identifies which output stream of a subprocess an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

/// Stable identity of a subprocess within its set.
///
/// Ids are monotonic per set and never reused, so they are safe to use as
/// keys in side tables (the status table, the scheduler's edge map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubprocessId(pub(crate) u64);

impl SubprocessId {
    /// The id as a plain integer, usable as a status-table command key.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One parent-side output stream of a child.
#[derive(Debug)]
struct OutputPipe {
    /// Read end of the pipe. None once the stream is closed - either EOF was
    /// observed or the subprocess runs on the console and never had a pipe.
    fd: Option<OwnedFd>,
    buf: Vec<u8>,
}

impl OutputPipe {
    fn new(fd: Option<OwnedFd>) -> OutputPipe {
        OutputPipe {
            fd,
            buf: Vec::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

/// A single async subprocess with captured stdout and stderr.
#[derive(Debug)]
pub struct Subprocess {
    id: SubprocessId,
    use_console: bool,
    stdout_pipe: OutputPipe,
    stderr_pipe: OutputPipe,
    /// Both streams interleaved in arrival order. The interleaving between
    /// the two streams is unpredictable, but each stream's own byte order is
    /// preserved, and `combined.len()` always equals the sum of the two
    /// stream buffers.
    combined: Vec<u8>,
    /// Child pid; None once the child has been reaped.
    pid: Option<Pid>,
    /// Exit status captured by the reap, whenever it happened, so a later
    /// `finish()` can still return it.
    exit_status: Option<ExitStatus>,
}

impl Subprocess {
    /// Spawn `command` under `/bin/sh -c`.
    ///
    /// Non-console children read stdin from `/dev/null`, write stdout and
    /// stderr into fresh pipes whose read ends the supervisor polls, and are
    /// placed into a new process group so interruption of the parent does
    /// not race-kill them and group signals can be delivered on teardown.
    /// Console children inherit the parent's terminal untouched.
    ///
    /// `parent_mask` is the signal mask from before the supervisor blocked
    /// its signals; it is restored in the child before exec so children do
    /// not start with SIGINT and friends blocked.
    pub(crate) fn spawn(
        id: SubprocessId,
        command: &str,
        use_console: bool,
        parent_mask: &SigSet,
    ) -> Result<Subprocess> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);

        if !use_console {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0);
        }

        let mask = *parent_mask;
        // SAFETY: sigprocmask is async-signal-safe, which is all that is
        // allowed between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
        }

        let mut child = cmd.spawn().map_err(|source| BexError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        let stdout_fd = child.stdout.take().map(OwnedFd::from);
        let stderr_fd = child.stderr.take().map(OwnedFd::from);
        // The Child handle is no longer needed: reaping goes through waitpid
        // so the supervisor can observe exits asynchronously.
        drop(child);

        debug!(id = id.0, pid = pid.as_raw(), use_console, command, "spawned subprocess");

        Ok(Subprocess {
            id,
            use_console,
            stdout_pipe: OutputPipe::new(stdout_fd),
            stderr_pipe: OutputPipe::new(stderr_fd),
            combined: Vec::new(),
            pid: Some(pid),
            exit_status: None,
        })
    }

    /// Stable identity of this subprocess.
    pub fn id(&self) -> SubprocessId {
        self.id
    }

    /// Whether this subprocess owns the terminal instead of pipes.
    pub fn use_console(&self) -> bool {
        self.use_console
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The read end of the given stream's pipe while it is open.
    pub(crate) fn pipe_fd(&self, stream: StreamKind) -> Option<BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        match stream {
            StreamKind::Stdout => self.stdout_pipe.fd.as_ref().map(|fd| fd.as_fd()),
            StreamKind::Stderr => self.stderr_pipe.fd.as_ref().map(|fd| fd.as_fd()),
        }
    }

    /// Service one readiness event on a stream: read what is available and
    /// append it, as one contiguous record, to the stream buffer and to the
    /// combined log. EOF and broken-pipe close the stream.
    pub(crate) fn on_pipe_ready(&mut self, stream: StreamKind) -> Result<()> {
        let (pipe, combined) = match stream {
            StreamKind::Stdout => (&mut self.stdout_pipe, &mut self.combined),
            StreamKind::Stderr => (&mut self.stderr_pipe, &mut self.combined),
        };
        let Some(fd) = pipe.fd.as_ref() else {
            return Ok(());
        };

        let mut chunk = [0u8; PIPE_READ_CHUNK];
        // None means the stream ended: EOF, or the pipe broke on the child
        // side.
        let read_len: Option<usize> = loop {
            match unistd::read(fd.as_raw_fd(), &mut chunk) {
                Ok(0) => break None,
                Ok(len) => break Some(len),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => break None,
                Err(errno) => return Err(errno.into()),
            }
        };

        match read_len {
            Some(len) => {
                pipe.buf.extend_from_slice(&chunk[..len]);
                combined.extend_from_slice(&chunk[..len]);
            }
            None => {
                trace!(id = self.id.0, ?stream, "stream closed");
                pipe.fd = None;
            }
        }
        Ok(())
    }

    /// True once both streams are closed and the child has been reaped.
    /// Console subprocesses have both streams treated as closed from
    /// creation, so for them this is purely the reap.
    pub fn done(&self) -> bool {
        self.streams_closed() && self.pid.is_none()
    }

    pub(crate) fn streams_closed(&self) -> bool {
        self.stdout_pipe.is_closed() && self.stderr_pipe.is_closed()
    }

    /// Reap the child if it has terminated, recording its exit status.
    /// Returns whether the child is now reaped. With empty flags this
    /// blocks until termination.
    pub(crate) fn try_finish(&mut self, flags: WaitPidFlag) -> Result<bool> {
        let Some(pid) = self.pid else {
            return Ok(true);
        };
        loop {
            match waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(false),
                Ok(WaitStatus::Exited(_, code)) => {
                    self.exit_status = Some(if code == 0 {
                        ExitStatus::Success
                    } else {
                        ExitStatus::Failure(code)
                    });
                    self.pid = None;
                    trace!(id = self.id.0, code, "subprocess exited");
                    return Ok(true);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.exit_status = Some(match signal {
                        Signal::SIGINT | Signal::SIGTERM | Signal::SIGHUP => {
                            ExitStatus::Interrupted
                        }
                        other => ExitStatus::Failure(128 + other as i32),
                    });
                    self.pid = None;
                    trace!(id = self.id.0, ?signal, "subprocess killed by signal");
                    return Ok(true);
                }
                // Stops and continues are not exits; the child lives on.
                Ok(_) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Wait for the child to terminate (a no-op when already reaped) and
    /// return its exit status. Must be called exactly once per subprocess
    /// collected from the finished queue.
    pub fn finish(&mut self) -> Result<ExitStatus> {
        self.try_finish(WaitPidFlag::empty())?;
        self.exit_status
            .ok_or_else(|| BexError::Io(io::Error::other("subprocess not reaped after wait")))
    }

    /// Combined stdout and stderr, in arrival order.
    pub fn combined_output(&self) -> &[u8] {
        &self.combined
    }

    /// The command's stdout only.
    pub fn stdout(&self) -> &[u8] {
        &self.stdout_pipe.buf
    }

    /// The command's stderr only.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr_pipe.buf
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        // Best-effort reap so dropped subprocesses do not linger as zombies.
        // Teardown paths that want the child gone have already signaled it;
        // never block here.
        if let Some(pid) = self.pid.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_equality() {
        assert_eq!(ExitStatus::Success, ExitStatus::Success);
        assert_ne!(ExitStatus::Success, ExitStatus::Failure(1));
        assert_eq!(ExitStatus::Failure(3), ExitStatus::Failure(3));
        assert_ne!(ExitStatus::Failure(3), ExitStatus::Failure(4));
        assert_ne!(ExitStatus::Interrupted, ExitStatus::Failure(130));
    }

    #[test]
    fn test_subprocess_id_as_key() {
        let id = SubprocessId(7);
        assert_eq!(id.as_u64(), 7);

        let mut map = std::collections::HashMap::new();
        map.insert(id, "edge");
        assert_eq!(map.get(&SubprocessId(7)), Some(&"edge"));
    }
}
