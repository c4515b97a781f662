//! Pub/sub detection engine.
//!
//! The engine owns the current [`Generation`] — an immutable snapshot of
//! every subscribed detector — behind an [`ArcSwap`]. Readers on the hot
//! path take a plain atomic load; writers (`subscribe`, `update`) are
//! serialized under one mutex and publish a whole new generation or
//! nothing at all. A [`Context`] created against one generation keeps that
//! generation alive for its entire lifetime, so a hot-reload never
//! invalidates a request already in flight.

pub mod context;
pub mod detector;
pub mod ruleset;

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::limiter::RateLimiter;
use crate::remote_config::Changeset;

pub use context::{Context, ContextStats, PublishError, PublishResult};
pub use detector::{
    Action, DetectionEvent, Detector, DetectorError, Listener, ListenerOutcome, ListenerStats,
    NoopDetector,
};

/// Verdict returned to the reporting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Record,
    Block,
    Redirect,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "ok",
            Verdict::Record => "record",
            Verdict::Block => "block",
            Verdict::Redirect => "redirect",
        }
    }
}

/// Immutable snapshot of the subscribed detectors. Replaced, never
/// mutated.
pub struct Generation {
    detectors: Vec<Arc<dyn Detector>>,
}

impl Generation {
    fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    pub fn detectors(&self) -> &[Arc<dyn Detector>] {
        &self.detectors
    }

    /// First ruleset version any detector reports.
    pub fn ruleset_version(&self) -> Option<&str> {
        self.detectors.iter().find_map(|d| d.ruleset_version())
    }
}

/// Outcome of a successful `update`, for logging and heartbeats.
#[derive(Debug)]
pub struct UpdateDiagnostics {
    /// Detector names that rebuilt from the changeset.
    pub rebuilt: Vec<String>,
}

/// Update failure: the previous generation is still active.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("detector '{detector}' rejected the update: {source}")]
    Update {
        detector: String,
        #[source]
        source: DetectorError,
    },
}

/// The engine: current generation + the sampling limiter contexts consult.
pub struct Engine {
    generation: ArcSwap<Generation>,
    limiter: Arc<RateLimiter>,
    /// Serializes `subscribe` and `update`. Readers never take it.
    write_lock: Mutex<()>,
}

impl Engine {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            generation: ArcSwap::from_pointee(Generation::empty()),
            limiter,
            write_lock: Mutex::new(()),
        }
    }

    /// Register a detector. Meant for service construction, before request
    /// traffic; serialized against updates all the same.
    pub fn subscribe(&self, detector: Arc<dyn Detector>) {
        let _guard = self.write_lock.lock();
        let current = self.generation.load_full();
        let mut detectors = current.detectors.clone();
        info!(detector = detector.name(), "subscribing detector");
        detectors.push(detector);
        self.generation.store(Arc::new(Generation { detectors }));
    }

    /// Apply a configuration changeset by rebuilding every detector.
    ///
    /// All-or-nothing: if any detector rejects the changeset, no new
    /// generation is published and the error describes which one failed.
    pub fn update(&self, changes: &Changeset) -> Result<UpdateDiagnostics, EngineError> {
        let _guard = self.write_lock.lock();
        let current = self.generation.load_full();

        let mut detectors = Vec::with_capacity(current.detectors.len());
        let mut rebuilt = Vec::new();
        for detector in &current.detectors {
            let name = detector.name().to_string();
            let next = detector
                .with_changes(changes)
                .map_err(|source| EngineError::Update {
                    detector: name.clone(),
                    source,
                })?;
            detectors.push(next);
            rebuilt.push(name);
        }

        self.generation.store(Arc::new(Generation { detectors }));
        info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            detectors = rebuilt.len(),
            "published new ruleset generation"
        );
        Ok(UpdateDiagnostics { rebuilt })
    }

    /// Snapshot the current generation into a fresh per-request context.
    /// Lock-free: one atomic load plus two refcount bumps.
    pub fn context(&self) -> Context {
        Context::new(self.generation.load_full(), Arc::clone(&self.limiter))
    }

    /// Current generation pointer, for diagnostics and tests.
    pub fn generation(&self) -> Arc<Generation> {
        self.generation.load_full()
    }

    /// Whether any non-inert detector is subscribed.
    pub fn is_armed(&self) -> bool {
        self.generation
            .load()
            .detectors
            .iter()
            .any(|d| !d.addresses().is_empty())
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("detectors", &self.generation.load().detectors.len())
            .field("rate", &self.limiter.rate())
            .finish()
    }
}

/// Log an update failure at the right level; helper shared by the poller
/// and tests.
pub fn log_update_error(err: &EngineError) {
    match err {
        EngineError::Update { detector, source } => {
            warn!(detector = %detector, error = %source, "ruleset update abandoned");
        }
    }
}
