//! Subprocess supervision.
//!
//! This module runs build commands as child processes and multiplexes their
//! output without threads:
//!
//! ```text
//!             ┌──────────────────┐
//!             │  SubprocessSet   │  ppoll() over all read pipes,
//!             │  (event loop)    │  SIGCHLD-driven reaping
//!             └───────┬──────────┘
//!           ┌─────────┼──────────┐
//!     ┌─────▼────┐ ┌──▼───────┐ ┌▼─────────┐
//!     │ Subproc 1│ │ Subproc 2│ │ Subproc N│   /bin/sh -c <command>
//!     │ out/err  │ │ out/err  │ │ console  │   own process group
//!     └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! The scheduler calls [`SubprocessSet::add`] to launch work,
//! [`SubprocessSet::do_work`] to block until something happens, and
//! [`SubprocessSet::next_finished`] to collect completed commands in the
//! order they finished. Interruption (SIGINT/SIGTERM/SIGHUP) wakes
//! `do_work` with `true`; [`SubprocessSet::clear`] propagates it to the
//! children's process groups.

mod set;
mod signals;
mod subprocess;

pub use set::SubprocessSet;
pub use subprocess::{ExitStatus, Subprocess, SubprocessId};
