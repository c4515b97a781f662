//! Top-level error types.
//!
//! Component-local errors live next to their components (`wire::RecvError`,
//! `engine::EngineError`, ...); this module holds the conditions that are
//! fatal to daemon startup and the conversions `main` needs. The split
//! follows one rule: anything a Session can answer with the `error`
//! sentinel stays component-local, anything that prevents the process from
//! serving at all lands here.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that prevent the daemon from starting or force it down.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Another instance already holds the exclusive instance lock.
    ///
    /// Not a failure: the loser logs and exits 0 so supervisor retries
    /// stay quiet.
    #[error("another instance holds the lock at {}", path.display())]
    AlreadyRunning { path: PathBuf },

    /// The lock file could not be created or locked for I/O reasons.
    #[error("cannot set up instance lock at {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Binding the listening socket failed.
    #[error("cannot bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The inherited listener descriptor was unusable.
    #[error("inherited socket fd {fd} is invalid: {reason}")]
    BadInheritedFd { fd: i32, reason: String },

    /// Installing signal handlers failed.
    #[error("cannot install signal handlers: {0}")]
    Signals(#[from] nix::Error),

    /// Accept-loop I/O failure other than EINTR.
    #[error("accept loop failed: {0}")]
    Accept(#[source] std::io::Error),
}
