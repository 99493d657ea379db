//! POSIX jobserver client and pool.
//!
//! The client talks to an inherited pipe or FIFO pool; the pool side creates
//! a fresh one and advertises it through a `MAKEFLAGS` fragment. Both sides
//! follow a strict descriptor-ownership discipline: the client never touches
//! the inherited descriptors directly, it duplicates them into non-blocking,
//! close-on-exec clones so the originals stay inheritable and blocking for
//! child processes.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat;
use nix::unistd;
use tracing::{debug, trace};

use super::{Config, Mode, Slot};
use crate::error::{BexError, Result};

/// Token byte written into fresh pools. GNU Make writes `'+'`; some other
/// pools write `'|'`. Clients must treat whatever byte they read as opaque.
const TOKEN_BYTE: u8 = b'+';

/// Filename prefix for pool FIFOs under `$TMPDIR`.
const FIFO_PREFIX: &str = "bex-jobserver-";

/// Disambiguates FIFO paths when one process creates several pools.
static POOL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Return true if `fd` refers to a pipe or FIFO.
fn is_fifo_fd(fd: BorrowedFd<'_>) -> bool {
    let Ok(owned) = fd.try_clone_to_owned() else {
        return false;
    };
    File::from(owned)
        .metadata()
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

/// Set `O_NONBLOCK` on a descriptor if not already set.
fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(BexError::Io(std::io::Error::last_os_error()));
        }
        if flags & libc::O_NONBLOCK == 0
            && libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(BexError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Duplicate an inherited descriptor into a non-blocking, close-on-exec
/// clone. The original stays untouched so children inherit the blocking,
/// inheritable variant the protocol requires.
fn duplicate_descriptor(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    // try_clone_to_owned dups with F_DUPFD_CLOEXEC, which also covers the
    // close-on-exec half of the contract.
    let duped = fd.try_clone_to_owned().map_err(BexError::Io)?;
    set_nonblocking(&duped)?;
    Ok(duped)
}

/// Jobserver client: acquires and releases slots from an external pool.
///
/// A client is constructed holding its implicit slot, so the first
/// [`Client::try_acquire`] always succeeds without touching the pool.
#[derive(Debug)]
pub struct Client {
    /// Still true while the implicit slot has not been handed out.
    has_implicit_slot: bool,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl Client {
    /// Create a client from a parsed [`Config`].
    pub fn from_config(config: &Config) -> Result<Client> {
        match config.mode {
            Mode::FileDescriptors => Client::from_pipe_fds(config.read_fd, config.write_fd),
            Mode::Fifo => Client::from_fifo(&config.path),
            _ => Err(BexError::UnsupportedMode(
                "Unsupported jobserver mode".to_string(),
            )),
        }
    }

    /// Build from a pair of inherited pipe descriptors.
    fn from_pipe_fds(read_fd: RawFd, write_fd: RawFd) -> Result<Client> {
        if read_fd < 0 || write_fd < 0 {
            return Err(BexError::EndpointSetup(
                "Invalid file descriptors".to_string(),
            ));
        }
        // SAFETY: the descriptors come from the tool-invocation environment;
        // they are only borrowed long enough to validate and duplicate them.
        let (read_fd, write_fd) = unsafe {
            (
                BorrowedFd::borrow_raw(read_fd),
                BorrowedFd::borrow_raw(write_fd),
            )
        };
        if !is_fifo_fd(read_fd) || !is_fifo_fd(write_fd) {
            return Err(BexError::EndpointSetup(
                "Invalid file descriptors".to_string(),
            ));
        }
        Ok(Client {
            has_implicit_slot: true,
            read_fd: duplicate_descriptor(read_fd)?,
            write_fd: duplicate_descriptor(write_fd)?,
        })
    }

    /// Build from a FIFO path, opening it once per direction.
    fn from_fifo(fifo_path: &str) -> Result<Client> {
        if fifo_path.is_empty() {
            return Err(BexError::EndpointSetup("Empty fifo path".to_string()));
        }
        let extra_flags = (OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).bits();

        let read_file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(extra_flags)
            .open(fifo_path)
            .map_err(|err| {
                BexError::EndpointSetup(format!("Error opening fifo for reading: {err}"))
            })?;
        let is_fifo = read_file
            .metadata()
            .map(|meta| meta.file_type().is_fifo())
            .unwrap_or(false);
        if !is_fifo {
            return Err(BexError::EndpointSetup(format!(
                "Not a fifo path: {fifo_path}"
            )));
        }

        let write_file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(extra_flags)
            .open(fifo_path)
            .map_err(|err| {
                BexError::EndpointSetup(format!("Error opening fifo for writing: {err}"))
            })?;

        Ok(Client {
            has_implicit_slot: true,
            read_fd: OwnedFd::from(read_file),
            write_fd: OwnedFd::from(write_file),
        })
    }

    /// Try to acquire one slot. Never blocks.
    ///
    /// Returns the implicit slot when it is still held, otherwise performs a
    /// single non-blocking one-byte read from the pool. Anything but a
    /// successful read yields an invalid slot; the caller should then wait
    /// for a running job to finish and retry.
    pub fn try_acquire(&mut self) -> Slot {
        if self.has_implicit_slot {
            self.has_implicit_slot = false;
            return Slot::implicit();
        }
        let mut token = [0u8; 1];
        loop {
            match unistd::read(self.read_fd.as_raw_fd(), &mut token) {
                Ok(1) => {
                    trace!(token = token[0], "acquired explicit job slot");
                    return Slot::explicit(token[0]);
                }
                Ok(_) => return Slot::invalid(),
                Err(Errno::EINTR) => continue,
                Err(_) => return Slot::invalid(),
            }
        }
    }

    /// Release a slot previously returned by [`Client::try_acquire`].
    ///
    /// Invalid slots are a no-op; the implicit slot is reclaimed locally;
    /// explicit slots write their token byte back to the pool. Write errors
    /// are swallowed: the protocol offers no remediation.
    pub fn release(&mut self, slot: Slot) {
        if slot.is_implicit() {
            debug_assert!(
                !self.has_implicit_slot,
                "Implicit slot cannot be released twice"
            );
            self.has_implicit_slot = true;
            return;
        }
        let Some(token) = slot.explicit_value() else {
            return;
        };
        loop {
            match unistd::write(&self.write_fd, &[token]) {
                Err(Errno::EINTR) => continue,
                _ => return,
            }
        }
    }
}

/// Jobserver pool: creates and owns a fresh pool of `N` job slots.
///
/// One slot is implicit for each participant; the remaining `N - 1` token
/// bytes are buffered in the pipe or FIFO. The pool descriptor handling is
/// the inverse of the client's: pipe descriptors are intentionally left
/// blocking and inheritable so that child processes can use them directly.
#[derive(Debug)]
pub struct Pool {
    /// Number of parallel job slots, including the implicit one.
    job_count: usize,
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
    /// Path of the FIFO node, for unlinking on drop. None in pipe mode.
    fifo_path: Option<PathBuf>,
}

impl Pool {
    /// Create a pool serving `num_slots` jobs.
    ///
    /// `mode` selects pipe ([`Mode::FileDescriptors`]) or FIFO
    /// ([`Mode::Fifo`]) transport. Fails with
    /// [`BexError::InvalidSlotCount`] when `num_slots < 2`: a pool needs the
    /// implicit slot plus at least one token.
    pub fn new(num_slots: usize, mode: Mode) -> Result<Pool> {
        if num_slots < 2 {
            return Err(BexError::InvalidSlotCount(num_slots));
        }
        match mode {
            Mode::FileDescriptors => Pool::with_pipe(num_slots),
            Mode::Fifo => Pool::with_fifo(num_slots),
            _ => Err(BexError::UnsupportedMode(
                "Unsupported jobserver mode".to_string(),
            )),
        }
    }

    fn with_pipe(num_slots: usize) -> Result<Pool> {
        // pipe() descriptors are already inheritable and blocking, which is
        // exactly what child processes need.
        let (read_fd, write_fd) = unistd::pipe().map_err(|err| {
            BexError::EndpointSetup(format!("Could not create anonymous pipe: {err}"))
        })?;
        let mut pool = Pool {
            job_count: num_slots,
            read_fd: Some(read_fd),
            write_fd: Some(write_fd),
            fifo_path: None,
        };
        pool.fill_slots(num_slots)?;
        debug!(slots = num_slots, "created pipe jobserver pool");
        Ok(pool)
    }

    fn with_fifo(num_slots: usize) -> Result<Pool> {
        let tmp_dir = std::env::var_os("TMPDIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let sequence = POOL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let fifo_path = tmp_dir.join(format!(
            "{FIFO_PREFIX}{}-{sequence}",
            std::process::id()
        ));

        // World read/write so jobserver clients running under a different
        // uid in the build can still open it.
        unistd::mkfifo(&fifo_path, stat::Mode::from_bits_truncate(0o666))
            .map_err(|err| BexError::EndpointSetup(format!("Cannot create fifo: {err}")))?;

        let mut pool = Pool {
            job_count: num_slots,
            read_fd: None,
            write_fd: None,
            fifo_path: Some(fifo_path.clone()),
        };

        // Opening read-write keeps the FIFO's kernel buffer alive for the
        // whole build even while no client has it open.
        let write_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_CLOEXEC.bits())
            .open(&fifo_path)
            .map_err(|err| BexError::EndpointSetup(format!("Could not open fifo: {err}")))?;
        pool.write_fd = Some(OwnedFd::from(write_file));

        pool.fill_slots(num_slots)?;
        debug!(slots = num_slots, path = %fifo_path.display(), "created fifo jobserver pool");
        Ok(pool)
    }

    /// Write `num_slots - 1` token bytes into the pool; the remaining slot
    /// is the implicit one every participant already owns.
    fn fill_slots(&mut self, num_slots: usize) -> Result<()> {
        let write_fd = self.write_fd.as_ref().expect("pool write endpoint");
        let mut remaining = num_slots - 1;
        while remaining > 0 {
            match unistd::write(write_fd.as_fd(), &[TOKEN_BYTE]) {
                Ok(1) => remaining -= 1,
                Err(Errno::EINTR) => continue,
                Ok(_) => {
                    return Err(BexError::EndpointSetup(
                        "Could not fill job slots pool: short write".to_string(),
                    ))
                }
                Err(err) => {
                    return Err(BexError::EndpointSetup(format!(
                        "Could not fill job slots pool: {err}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Number of job slots served, including the implicit one.
    pub fn job_count(&self) -> usize {
        self.job_count
    }

    /// The fragment to splice into the `MAKEFLAGS` value of launched tools.
    /// The leading space is significant.
    ///
    /// Pipe pools emit both the modern `--jobserver-auth=R,W` and the legacy
    /// `--jobserver-fds=R,W` spelling for the benefit of older tooling; the
    /// last recognized option wins in client code, so both may coexist.
    pub fn env_value(&self) -> String {
        if let Some(fifo_path) = &self.fifo_path {
            return format!(
                " -j{} --jobserver-auth=fifo:{}",
                self.job_count,
                fifo_path.display()
            );
        }
        let (Some(read_fd), Some(write_fd)) = (&self.read_fd, &self.write_fd) else {
            return String::new();
        };
        let (read_fd, write_fd) = (read_fd.as_raw_fd(), write_fd.as_raw_fd());
        format!(
            " -j{} --jobserver-fds={read_fd},{write_fd} --jobserver-auth={read_fd},{write_fd}",
            self.job_count
        )
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Owned descriptors close themselves; only the FIFO node needs
        // explicit cleanup.
        if let Some(fifo_path) = &self.fifo_path {
            let _ = std::fs::remove_file(fifo_path);
        }
    }
}
