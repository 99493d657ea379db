//! GNU Make jobserver endpoint.
//!
//! The jobserver protocol coordinates build parallelism across cooperating
//! tools: a pool of token bytes lives in a shared pipe or FIFO, and every
//! participant may run one job on its *implicit* slot plus one job per token
//! byte it reads from the pool. Tokens must be written back verbatim when the
//! job finishes.
//!
//! This module provides the typed [`Config`] produced by parsing the
//! `MAKEFLAGS` environment variable, the move-only [`Slot`] resource, and the
//! platform [`Client`] / [`Pool`] implementations.
//!
//! Protocol reference:
//! <https://www.gnu.org/software/make/manual/html_node/POSIX-Jobserver.html>

use crate::error::{BexError, Result};

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::{Client, Pool};

/// Name of the environment variable carrying the jobserver authorization.
pub const MAKEFLAGS_ENV: &str = "MAKEFLAGS";

/// How the pool is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No jobserver configured (or explicitly disabled).
    #[default]
    None,
    /// A pair of inherited pipe descriptors (`--jobserver-auth=R,W`).
    FileDescriptors,
    /// A named FIFO on the filesystem (`--jobserver-auth=fifo:PATH`).
    Fifo,
    /// A named Win32 semaphore (`--jobserver-auth=NAME`).
    Win32Semaphore,
}

/// Typed jobserver configuration, produced by [`parse_makeflags`] and
/// consumed by the [`Client`] and [`Pool`] factories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    /// Read descriptor in [`Mode::FileDescriptors`], -1 otherwise.
    pub read_fd: i32,
    /// Write descriptor in [`Mode::FileDescriptors`], -1 otherwise.
    pub write_fd: i32,
    /// FIFO path or semaphore name, empty otherwise.
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::None,
            read_fd: -1,
            write_fd: -1,
            path: String::new(),
        }
    }
}

impl Config {
    fn with_fds(read_fd: i32, write_fd: i32) -> Self {
        Config {
            // Any negative descriptor means the feature is disabled.
            mode: if read_fd < 0 || write_fd < 0 {
                Mode::None
            } else {
                Mode::FileDescriptors
            },
            read_fd,
            write_fd,
            path: String::new(),
        }
    }
}

/// One unit of build parallelism.
///
/// Slots are move-only resources: a slot can be released at most once, and
/// the type system enforces it (releasing consumes the slot). Dropping an
/// acquired explicit slot without releasing it leaks a pool token.
#[derive(Debug)]
pub struct Slot(SlotValue);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotValue {
    Invalid,
    Implicit,
    Explicit(u8),
}

impl Slot {
    pub(crate) fn invalid() -> Self {
        Slot(SlotValue::Invalid)
    }

    pub(crate) fn implicit() -> Self {
        Slot(SlotValue::Implicit)
    }

    pub(crate) fn explicit(token: u8) -> Self {
        Slot(SlotValue::Explicit(token))
    }

    /// True for implicit and explicit slots; false for a failed acquire.
    pub fn is_valid(&self) -> bool {
        self.0 != SlotValue::Invalid
    }

    /// True for the client's locally reserved slot.
    pub fn is_implicit(&self) -> bool {
        self.0 == SlotValue::Implicit
    }

    /// True for a slot backed by a token byte read from the pool.
    pub fn is_explicit(&self) -> bool {
        matches!(self.0, SlotValue::Explicit(_))
    }

    /// The token byte, for explicit slots. The value is opaque: different
    /// pool implementations write different bytes.
    pub fn explicit_value(&self) -> Option<u8> {
        match self.0 {
            SlotValue::Explicit(token) => Some(token),
            _ => None,
        }
    }
}

/// Parse a `MAKEFLAGS` value into a [`Config`].
///
/// The input is split on ASCII spaces and tabs. If the first word does not
/// start with `-` and contains the letter `n`, make was invoked with `-n`
/// (dry run) and no jobserver should be used. Otherwise the last recognized
/// `--jobserver-auth=` / `--jobserver-fds=` option wins.
///
/// Empty and whitespace-only inputs succeed with [`Mode::None`].
pub fn parse_makeflags(makeflags: &str) -> Result<Config> {
    let mut config = Config::default();

    let args: Vec<&str> = makeflags
        .split([' ', '\t'])
        .filter(|word| !word.is_empty())
        .collect();

    // GNU Make puts all single-letter flags in the first word, without a
    // leading dash. An `n` there means dry-run: report no jobserver so the
    // caller performs no work. Words that do start with a dash are ordinary
    // options and never trigger this gate.
    if let Some(first) = args.first() {
        if !first.starts_with('-') && first.contains('n') {
            return Ok(config);
        }
    }

    for arg in &args {
        if let Some(value) = arg.strip_prefix("--jobserver-auth=") {
            if let Some((read_fd, write_fd)) = parse_fd_pair(value) {
                config = Config::with_fds(read_fd, write_fd);
            } else if let Some(fifo_path) = value.strip_prefix("fifo:") {
                config = Config {
                    mode: Mode::Fifo,
                    read_fd: -1,
                    write_fd: -1,
                    path: fifo_path.to_string(),
                };
            } else {
                config = Config {
                    mode: Mode::Win32Semaphore,
                    read_fd: -1,
                    write_fd: -1,
                    path: value.to_string(),
                };
            }
            continue;
        }

        // --jobserver-fds is an old undocumented variant of --jobserver-auth
        // that only accepts a descriptor pair. It was replaced in GNU Make
        // 4.2 but pools still emit both forms for older tooling.
        if let Some(value) = arg.strip_prefix("--jobserver-fds=") {
            let Some((read_fd, write_fd)) = parse_fd_pair(value) else {
                return Err(BexError::BadDescriptorPair(value.to_string()));
            };
            config = Config::with_fds(read_fd, write_fd);
            config.mode = Mode::FileDescriptors;
            continue;
        }

        // Anything else (e.g. `-j8`, `ks`) is ignored. MAKEFLAGS never
        // separates an option from its argument with a space.
    }

    Ok(config)
}

/// Like [`parse_makeflags`], but additionally reject modes this platform
/// cannot serve.
pub fn parse_native_makeflags(makeflags: &str) -> Result<Config> {
    let config = parse_makeflags(makeflags)?;

    #[cfg(windows)]
    {
        if config.mode == Mode::Fifo {
            return Err(BexError::UnsupportedMode(
                "FIFO mode is not available on Windows!".to_string(),
            ));
        }
        if config.mode == Mode::FileDescriptors {
            return Err(BexError::UnsupportedMode(
                "File-descriptor based authentication is not available on Windows!".to_string(),
            ));
        }
    }
    #[cfg(not(windows))]
    {
        if config.mode == Mode::Win32Semaphore {
            return Err(BexError::UnsupportedMode(
                "Semaphore mode is only available on Windows!".to_string(),
            ));
        }
    }

    Ok(config)
}

/// Parse the `MAKEFLAGS` variable from the process environment.
///
/// An absent variable behaves like an empty one.
pub fn parse_env() -> Result<Config> {
    let makeflags = std::env::var(MAKEFLAGS_ENV).unwrap_or_default();
    parse_native_makeflags(&makeflags)
}

/// Split `R,W` into two decimal integers. Unlike the pool descriptors
/// themselves, negative values are accepted here: they are the documented
/// way to disable the feature.
fn parse_fd_pair(value: &str) -> Option<(i32, i32)> {
    let (read, write) = value.split_once(',')?;
    Some((read.parse().ok()?, write.parse().ok()?))
}
