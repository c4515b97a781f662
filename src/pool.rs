//! Connection acceptor and reusable worker pool.
//!
//! One worker thread serves one connection at a time. An accepted
//! connection goes to an idle worker when one is parked on the queue;
//! otherwise (none idle, or all idle workers already spoken for) a new
//! worker is spawned with the connection as its first job. Idle workers
//! wake every poll interval to check the running flag, so shutdown never
//! needs to interrupt a wait.
//!
//! Shutdown flips the running flag and polls the live-worker counter for
//! a bounded grace period. Workers still inside a session finish their
//! connection on their own time.

use std::collections::VecDeque;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::error::DaemonError;
use crate::service::ServiceRegistry;
use crate::session::Session;

/// What a worker does with one connection.
pub type ConnectionHandler = Arc<dyn Fn(UnixStream) + Send + Sync>;

struct PoolInner {
    queue: Mutex<VecDeque<UnixStream>>,
    available: Condvar,
    running: AtomicBool,
    idle: AtomicUsize,
    live: AtomicUsize,
    handler: ConnectionHandler,
    idle_poll: Duration,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(handler: ConnectionHandler, idle_poll: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                running: AtomicBool::new(true),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                handler,
                idle_poll,
            }),
        }
    }

    /// Pool whose workers run one client session per connection.
    pub fn serving(registry: Arc<ServiceRegistry>, config: RuntimeConfig) -> Self {
        let idle_poll = config.worker_idle_poll;
        let handler: ConnectionHandler = Arc::new(move |stream| {
            Session::new(stream, Arc::clone(&registry), &config).run();
        });
        Self::new(handler, idle_poll)
    }

    /// Hand one accepted connection to the pool.
    pub fn dispatch(&self, stream: UnixStream) {
        let mut queue = self.inner.queue.lock();
        // Every parked worker will take exactly one queued connection;
        // beyond that the queue is effectively full and we spawn.
        if self.inner.idle.load(Ordering::SeqCst) > queue.len() {
            queue.push_back(stream);
            self.inner.available.notify_one();
            return;
        }
        drop(queue);
        self.spawn_worker(stream);
    }

    fn spawn_worker(&self, first: UnixStream) {
        let inner = Arc::clone(&self.inner);
        inner.live.fetch_add(1, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name("wardgate-worker".to_string())
            .spawn(move || worker_loop(inner, first));
        if let Err(e) = spawned {
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
            error!(error = %e, "cannot spawn worker, dropping connection");
        }
    }

    /// Stop accepting queued work and wait (bounded) for workers to exit.
    /// Returns whether the pool fully drained.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.available.notify_all();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.inner.live.load(Ordering::SeqCst) == 0 {
                info!("worker pool drained");
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let live = self.inner.live.load(Ordering::SeqCst);
        info!(live, "worker pool shutdown grace expired");
        live == 0
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn idle_workers(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }
}

fn worker_loop(inner: Arc<PoolInner>, first: UnixStream) {
    let mut next = Some(first);
    while let Some(stream) = next.take() {
        (inner.handler)(stream);
        next = park_for_work(&inner);
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
    debug!("worker exiting");
}

/// Park on the queue until work arrives or the pool stops running.
fn park_for_work(inner: &PoolInner) -> Option<UnixStream> {
    let mut queue = inner.queue.lock();
    inner.idle.fetch_add(1, Ordering::SeqCst);
    loop {
        if let Some(stream) = queue.pop_front() {
            inner.idle.fetch_sub(1, Ordering::SeqCst);
            return Some(stream);
        }
        if !inner.running.load(Ordering::SeqCst) {
            inner.idle.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        inner.available.wait_for(&mut queue, inner.idle_poll);
    }
}

/// Blocking accept loop. Returns cleanly once `shutdown` is observed;
/// signal delivery interrupts the blocking accept via EINTR.
pub fn run_acceptor(
    listener: &UnixListener,
    pool: &WorkerPool,
    shutdown: &AtomicBool,
) -> Result<(), DaemonError> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                debug!("connection accepted");
                pool.dispatch(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DaemonError::Accept(e)),
        }
    }
}
