//! Daemon runtime configuration.
//!
//! CLI flags (with env fallbacks) cover the knobs an operator sets; the
//! wire limits are process-wide constants because they are part of the
//! protocol contract, not tuning.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

/// Command-line / environment configuration for the daemon.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path of the Unix socket to listen on.
    #[arg(long, env = "WARDGATE_SOCKET_PATH", default_value = "/tmp/wardgate.sock")]
    pub socket_path: PathBuf,

    /// Path of the exclusive instance lock file.
    #[arg(long, env = "WARDGATE_LOCK_PATH", default_value = "/tmp/wardgate.lock")]
    pub lock_path: PathBuf,

    /// Inherited listener file descriptor; when set, `--socket-path` is not
    /// bound and this pre-opened descriptor is served instead.
    #[arg(long, env = "WARDGATE_SOCKET_FD")]
    pub socket_fd: Option<i32>,
}

/// Tunables that do not warrant a CLI flag.
///
/// Invalid env values fall back to the default with a warning, never an
/// error: a typo in an env var must not take the sidecar down.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum accepted frame body size in bytes.
    pub max_body_bytes: usize,
    /// Header receive window while a session is still bootstrapping.
    pub init_recv_timeout: Duration,
    /// Body receive window once a header has arrived.
    pub body_recv_timeout: Duration,
    /// Worker idle poll interval.
    pub worker_idle_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            init_recv_timeout: Duration::from_millis(500),
            body_recv_timeout: Duration::from_millis(300),
            worker_idle_poll: Duration::from_millis(100),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// - `WARDGATE_MAX_BODY_BYTES` (default: 1048576)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("WARDGATE_MAX_BODY_BYTES") {
            match val.parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.max_body_bytes = bytes,
                _ => {
                    warn!(
                        env_var = "WARDGATE_MAX_BODY_BYTES",
                        value = %val,
                        default = config.max_body_bytes,
                        "Invalid value for environment variable, using default"
                    );
                }
            }
        }

        config
    }
}
