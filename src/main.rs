//! wardgate - local detection sidecar daemon.
//!
//! Listens on a Unix socket for telemetry from instrumented applications
//! and answers each request cycle with a detection verdict. One instance
//! serves one socket path; an exclusive lock file enforces that, and a
//! losing instance exits cleanly so supervisors stay quiet.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info};
use wardgate::config::{Cli, RuntimeConfig};
use wardgate::error::DaemonError;
use wardgate::lock::InstanceLock;
use wardgate::pool::{run_acceptor, WorkerPool};
use wardgate::service::ServiceRegistry;

/// Set by the signal handler, polled by the accept loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Grace period for draining workers on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

extern "C" fn on_signal(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("WARDGATE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_env();

    match run(&cli, runtime) {
        Ok(()) => ExitCode::SUCCESS,
        Err(DaemonError::AlreadyRunning { path }) => {
            info!(lock = %path.display(), "another instance is serving, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, runtime: RuntimeConfig) -> Result<(), DaemonError> {
    let _lock = InstanceLock::acquire(&cli.lock_path)?;
    install_signal_handlers()?;

    let (listener, bound_path) = open_listener(cli)?;
    info!(
        socket = %cli.socket_path.display(),
        lock = %cli.lock_path.display(),
        inherited_fd = cli.socket_fd,
        max_body_bytes = runtime.max_body_bytes,
        "wardgate starting"
    );

    let registry = Arc::new(ServiceRegistry::new());
    let pool = WorkerPool::serving(registry, runtime);

    let result = run_acceptor(&listener, &pool, &SHUTDOWN);

    info!("draining worker pool");
    pool.shutdown(DRAIN_GRACE);
    if let Some(path) = bound_path {
        let _ = std::fs::remove_file(path);
    }
    result
}

/// Bind the configured socket path, or adopt an inherited descriptor.
fn open_listener(cli: &Cli) -> Result<(UnixListener, Option<PathBuf>), DaemonError> {
    if let Some(fd) = cli.socket_fd {
        if fd < 0 {
            return Err(DaemonError::BadInheritedFd {
                fd,
                reason: "negative descriptor".to_string(),
            });
        }
        let listener = adopt_fd(fd);
        return match listener.local_addr() {
            Ok(_) => Ok((listener, None)),
            Err(e) => Err(DaemonError::BadInheritedFd {
                fd,
                reason: e.to_string(),
            }),
        };
    }

    // A stale socket file from a dead instance would fail the bind; the
    // instance lock already guarantees nobody live is serving it.
    if cli.socket_path.exists() {
        let _ = std::fs::remove_file(&cli.socket_path);
    }
    let listener = UnixListener::bind(&cli.socket_path).map_err(|source| DaemonError::Bind {
        path: cli.socket_path.clone(),
        source,
    })?;
    Ok((listener, Some(cli.socket_path.clone())))
}

#[allow(unsafe_code)]
fn adopt_fd(fd: i32) -> UnixListener {
    use std::os::fd::FromRawFd;
    // Ownership of the descriptor transfers to the listener; the spawning
    // process promises not to use it concurrently.
    unsafe { UnixListener::from_raw_fd(fd) }
}

#[allow(unsafe_code)]
fn install_signal_handlers() -> Result<(), DaemonError> {
    // No SA_RESTART: signal delivery must interrupt the blocking accept
    // so the loop observes the shutdown flag.
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}
