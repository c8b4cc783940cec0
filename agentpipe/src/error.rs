//! Error types for agentpipe operations.
//!
//! Two severities are kept apart. Recoverable failures are returned as
//! [`Error`]. Conditions that indicate a broken transport or a programmer
//! error go through [`fatal!`], which logs and panics; release builds are
//! compiled with `panic = "abort"`, so that terminates the agent.

use std::fmt;
use std::io;

/// Alias for `Result<T, agentpipe::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable errors returned by endpoint setup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No acceptor could be reached at the given name.
    #[error("connect to {name}: {source}")]
    Connect {
        /// Name the initiator tried to reach.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The listening side of a named endpoint could not be created.
    #[error("bind {name}: {source}")]
    Bind {
        /// Name the acceptor tried to listen on.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Any other I/O error during setup (e.g. switching a handle to
    /// non-blocking mode).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Logs `args` and panics. Never returns.
#[cold]
#[track_caller]
#[allow(clippy::panic)]
pub(crate) fn abort_with(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("fatal: {args}");
    panic!("{args}");
}

/// Raises a fatal, non-recoverable condition.
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::error::abort_with(format_args!($($arg)+))
    };
}
pub(crate) use fatal;
