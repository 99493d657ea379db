//! bex - build-parallelism coordination core.
//!
//! This crate is the concurrency heart of a build executor that speaks the
//! GNU Make jobserver protocol. It provides:
//!
//! - A jobserver endpoint: a [`jobserver::Client`] that acquires and releases
//!   job slots from an externally owned pool, and a [`jobserver::Pool`] that
//!   creates a fresh pool and exports it through `MAKEFLAGS`.
//! - A subprocess supervisor: [`process::SubprocessSet`] runs a single-threaded
//!   `ppoll` event loop over many [`process::Subprocess`] children,
//!   multiplexing their stdout/stderr streams, reaping exits asynchronously
//!   and propagating interruption signals.
//! - Supporting value types: [`paths::CanonicalPath`] used as a stable target
//!   identifier, and [`status::StatusTable`] which renders the oldest
//!   in-flight commands on smart terminals.
//!
//! Scheduling policy, manifest parsing and the dependency database live in
//! the surrounding executor; this crate only governs how concurrent work is
//! admitted and tracked.

pub mod error;
pub mod jobserver;
pub mod logging;
pub mod paths;
pub mod process;
pub mod status;

pub use error::{BexError, Result};
