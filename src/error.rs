//! Error types for bex.

use thiserror::Error;

/// Main error type for bex.
#[derive(Error, Debug)]
pub enum BexError {
    /// A `--jobserver-fds=` value that is not a pair of decimal integers.
    #[error("Invalid file descriptor pair [{0}]")]
    BadDescriptorPair(String),

    /// The requested jobserver mode cannot be served here.
    #[error("{0}")]
    UnsupportedMode(String),

    /// Pool creation with fewer than two job slots.
    #[error("At least 2 job slots needed, got {0}")]
    InvalidSlotCount(usize),

    /// Bad descriptor, missing or non-FIFO path, or an open/mkfifo failure
    /// while setting up a jobserver endpoint.
    #[error("{0}")]
    EndpointSetup(String),

    /// Fatal child-creation failure.
    #[error("Failed to spawn command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A second SubprocessSet was constructed while one is still alive.
    /// Signal-handler state is process-wide, so only one may exist.
    #[error("A subprocess supervisor is already active in this process")]
    SupervisorActive,

    /// Unexpected OS failure during the event loop.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for BexError {
    fn from(errno: nix::errno::Errno) -> Self {
        BexError::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

/// Result type alias for bex operations.
pub type Result<T> = std::result::Result<T, BexError>;
