//! Logging setup for embedders of the crate.
//!
//! The library itself only emits `tracing` events; binaries embedding it can
//! call [`init`] to get a sensible subscriber wired to the environment.
//!
//! # Environment variables
//!
//! - `BEX_LOG` - log filter (overrides `RUST_LOG`)
//! - `RUST_LOG` - standard Rust log filter (fallback)

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the preferred log filter.
pub const LOG_ENV: &str = "BEX_LOG";

/// Build the environment filter: `BEX_LOG` wins over `RUST_LOG`, and
/// `default_level` applies when neither is set.
fn env_filter(default_level: Level) -> EnvFilter {
    if let Ok(filter) = std::env::var(LOG_ENV) {
        return EnvFilter::new(filter);
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Initialize a stderr subscriber. Returns an error if a global subscriber
/// is already set.
pub fn try_init(default_level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(Into::into)
}

/// Initialize a stderr subscriber, ignoring an already-installed one.
pub fn init(default_level: Level) {
    let _ = try_init(default_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(Level::WARN);
        init(Level::WARN);
        assert!(try_init(Level::WARN).is_err());
    }
}
