//! Detection capability boundary.
//!
//! A [`Detector`] wraps one instance of a rule-evaluation backend behind a
//! stable interface: it declares the data addresses it subscribes to, can
//! rebuild itself from a configuration changeset, and produces one
//! [`Listener`] per request. The backend itself is opaque to the rest of
//! the daemon — the engine only ever sees these two traits.
//!
//! Two variants ship in-tree: [`NoopDetector`] (a service whose ruleset
//! failed to load keeps a working but inert engine) and the regex ruleset
//! backend in [`super::ruleset`].

use std::collections::BTreeMap;
use std::sync::Arc;

use rmpv::Value;
use serde::Serialize;
use thiserror::Error;

use crate::remote_config::Changeset;

/// One rule match, serialized to JSON for the `triggers` reply field.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub rule_id: String,
    pub rule_name: String,
    pub tags: BTreeMap<String, String>,
    /// Address whose data matched.
    pub address: String,
    /// The matched value, verbatim.
    pub matched: String,
}

/// Enforcement requested by a matched rule. Ordered weakest to strongest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Record,
    Redirect { status_code: u16, location: String },
    Block { status_code: u16 },
}

impl Action {
    /// Rank used when merging actions from several listeners.
    pub fn severity(&self) -> u8 {
        match self {
            Action::Record => 0,
            Action::Redirect { .. } => 1,
            Action::Block { .. } => 2,
        }
    }
}

/// What one listener produced for one published input.
#[derive(Debug, Default)]
pub struct ListenerOutcome {
    pub events: Vec<DetectionEvent>,
    pub actions: Vec<Action>,
    /// Derived data (schemas, fingerprints) keyed by output address.
    pub derived: Vec<(String, Value)>,
    /// Backend requested that this trace be kept regardless of sampling.
    pub keep: bool,
    /// Evaluation hit its deadline. A reported condition, not an error.
    pub timed_out: bool,
}

impl ListenerOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.actions.is_empty() && self.derived.is_empty()
    }
}

/// Per-request accounting, drained at context teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerStats {
    pub duration_us: u64,
    pub timeouts: u32,
}

/// Backend failures surfaced through the capability boundary.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("backend internal failure: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid backend object: {0}")]
    InvalidObject(String),

    #[error("configuration rejected: {0}")]
    Config(String),
}

/// One detection capability, immutable once built.
pub trait Detector: Send + Sync {
    /// Stable capability name (also its identity within a generation).
    fn name(&self) -> &str;

    /// Data addresses this capability wants published to it.
    fn addresses(&self) -> &[String];

    /// Remote-config products this capability consumes.
    fn products(&self) -> &[String];

    /// Build the per-request listener.
    fn listener(&self) -> Box<dyn Listener>;

    /// Produce an updated detector from a configuration changeset.
    ///
    /// Must not mutate `self`; a failure leaves the caller free to keep
    /// using the existing detector.
    fn with_changes(&self, changes: &Changeset) -> Result<Arc<dyn Detector>, DetectorError>;

    /// Version string of the loaded ruleset, when the backend has one.
    fn ruleset_version(&self) -> Option<&str> {
        None
    }
}

/// Per-request mutable state bound to one detector.
pub trait Listener: Send {
    /// Feed one published input to the backend.
    fn observe(
        &mut self,
        input: &Value,
        scope: Option<&str>,
    ) -> Result<ListenerOutcome, DetectorError>;

    /// Accounting accumulated so far.
    fn stats(&self) -> ListenerStats;
}

/// Inert detector used when a service is constructed without a working
/// ruleset: the engine shape stays intact, every observation is empty.
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn name(&self) -> &str {
        "noop"
    }

    fn addresses(&self) -> &[String] {
        &[]
    }

    fn products(&self) -> &[String] {
        &[]
    }

    fn listener(&self) -> Box<dyn Listener> {
        Box::new(NoopListener)
    }

    fn with_changes(&self, _changes: &Changeset) -> Result<Arc<dyn Detector>, DetectorError> {
        Ok(Arc::new(NoopDetector))
    }
}

struct NoopListener;

impl Listener for NoopListener {
    fn observe(
        &mut self,
        _input: &Value,
        _scope: Option<&str>,
    ) -> Result<ListenerOutcome, DetectorError> {
        Ok(ListenerOutcome::default())
    }

    fn stats(&self) -> ListenerStats {
        ListenerStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_detector_observes_nothing() {
        let detector = NoopDetector;
        let mut listener = detector.listener();
        let input = Value::Map(vec![(Value::from("k"), Value::from("v"))]);
        let outcome = listener.observe(&input, None).expect("observe");
        assert!(outcome.is_empty());
        assert!(!outcome.keep);
    }

    #[test]
    fn action_severity_orders_block_highest() {
        let block = Action::Block { status_code: 403 };
        let redirect = Action::Redirect {
            status_code: 303,
            location: "/".to_string(),
        };
        assert!(block.severity() > redirect.severity());
        assert!(redirect.severity() > Action::Record.severity());
    }
}
