//! Remote-config polling thread.
//!
//! One poller per engine. Each tick takes a full snapshot from the
//! source, diffs it against the previous one, and applies the delta via
//! `Engine::update`. A failed update keeps the previous snapshot as the
//! baseline so the same delta is retried on the next tick; a failed
//! snapshot read skips the tick entirely.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Changeset, ConfigKey, ConfigSource};
use crate::engine::{log_update_error, Engine};

/// Granularity of the stop-flag check while waiting out an interval.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Owns the poller thread; stops and joins it on drop.
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Spawn a poller driving `engine` from `source` every `interval`.
    pub fn spawn(
        engine: Arc<Engine>,
        source: Box<dyn ConfigSource>,
        interval: Duration,
    ) -> PollerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("wardgate-rc-poller".to_string())
            .spawn(move || run(engine, source, interval, stop_flag))
            .ok();
        if thread.is_none() {
            warn!("could not spawn remote-config poller thread");
        }

        PollerHandle { stop, thread }
    }

    /// Signal the thread to stop and wait for it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    engine: Arc<Engine>,
    source: Box<dyn ConfigSource>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut last: BTreeMap<ConfigKey, Vec<u8>> = BTreeMap::new();

    while !stop.load(Ordering::SeqCst) {
        match source.snapshot() {
            Ok(current) => {
                let changes = diff(&last, &current);
                if changes.is_empty() {
                    debug!("remote-config snapshot unchanged");
                } else {
                    match engine.update(&changes) {
                        Ok(diagnostics) => {
                            debug!(
                                rebuilt = diagnostics.rebuilt.len(),
                                added = changes.added.len(),
                                removed = changes.removed.len(),
                                "remote-config delta applied"
                            );
                            last = current;
                        }
                        // Keep the old baseline: the delta is retried
                        // next tick against whatever the agent serves then.
                        Err(e) => log_update_error(&e),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "remote-config snapshot failed, skipping tick");
            }
        }

        wait(interval, &stop);
    }
}

/// Delta between two snapshots. An entry counts as added when it is new
/// or its content changed; removed when it disappeared.
fn diff(last: &BTreeMap<ConfigKey, Vec<u8>>, current: &BTreeMap<ConfigKey, Vec<u8>>) -> Changeset {
    let mut changes = Changeset::default();

    for (key, content) in current {
        if last.get(key) != Some(content) {
            changes.added.insert(key.clone(), content.clone());
        }
    }
    for key in last.keys() {
        if !current.contains_key(key) {
            changes.removed.insert(key.clone());
        }
    }
    changes
}

fn wait(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
}
