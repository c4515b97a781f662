//! Per-request context.
//!
//! A context pins the generation it was created against, lazily creates
//! one listener per subscribed detector, and keeps every non-ephemeral
//! published input alive until teardown — backends may hold references
//! into published data for the rest of the request.

use std::sync::Arc;

use rmpv::Value;
use thiserror::Error;
use tracing::warn;

use super::detector::{Action, Listener, ListenerOutcome};
use super::{Generation, Verdict};
use crate::limiter::RateLimiter;

/// Structurally invalid input. The caller's data is presumed corrupted.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("published input is not a map")]
    NotAMap,
}

/// Aggregated result of one publish that raised something.
#[derive(Debug)]
pub struct PublishResult {
    pub verdict: Verdict,
    /// Verdict parameters (block status code, redirect location, ...).
    pub parameters: Vec<(String, String)>,
    /// Matched events, one JSON document per string.
    pub triggers: Vec<String>,
    /// Derived data keyed by output address.
    pub derived: Vec<(String, Value)>,
    pub force_keep: bool,
}

/// Accounting attached to the request-end reply.
#[derive(Debug, Default)]
pub struct ContextStats {
    pub duration_us: u64,
    pub timeouts: u32,
    pub ruleset_version: Option<String>,
}

pub struct Context {
    generation: Arc<Generation>,
    limiter: Arc<RateLimiter>,
    /// Parallel to `generation.detectors()`; filled on first publish.
    listeners: Vec<Option<Box<dyn Listener>>>,
    /// Published inputs, kept alive for the context's lifetime.
    retained: Vec<Value>,
}

impl Context {
    pub(super) fn new(generation: Arc<Generation>, limiter: Arc<RateLimiter>) -> Self {
        let slots = generation.detectors().len();
        let mut listeners = Vec::with_capacity(slots);
        listeners.resize_with(slots, || None);
        Self {
            generation,
            limiter,
            listeners,
            retained: Vec::new(),
        }
    }

    /// Fan one input out to every listener and merge what they raise.
    ///
    /// Returns `Ok(None)` when nothing matched (allow). Ephemeral inputs
    /// are evaluated but not retained — they exist for auxiliary
    /// mid-request checks and must not shadow the primary published data.
    ///
    /// A listener failure is logged and skipped; remaining listeners still
    /// run.
    pub fn publish(
        &mut self,
        input: Value,
        scope: Option<&str>,
        ephemeral: bool,
    ) -> Result<Option<PublishResult>, PublishError> {
        if !input.is_map() {
            return Err(PublishError::NotAMap);
        }

        let generation = Arc::clone(&self.generation);
        let input_ref: &Value = if ephemeral {
            &input
        } else {
            self.retained.push(input);
            // Just pushed, cannot be empty.
            match self.retained.last() {
                Some(v) => v,
                None => unreachable!(),
            }
        };

        let mut merged = ListenerOutcome::default();
        for (slot, detector) in generation.detectors().iter().enumerate() {
            let listener = self.listeners[slot].get_or_insert_with(|| detector.listener());
            match listener.observe(input_ref, scope) {
                Ok(outcome) => {
                    merged.keep |= outcome.keep;
                    merged.timed_out |= outcome.timed_out;
                    merged.events.extend(outcome.events);
                    merged.actions.extend(outcome.actions);
                    merged.derived.extend(outcome.derived);
                }
                Err(e) => {
                    warn!(
                        detector = detector.name(),
                        error = %e,
                        "listener failed, skipping"
                    );
                }
            }
        }

        if merged.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.merge_result(merged)))
    }

    fn merge_result(&self, merged: ListenerOutcome) -> PublishResult {
        let strongest = merged
            .actions
            .iter()
            .max_by_key(|a| a.severity())
            .cloned()
            .unwrap_or(Action::Record);

        let (verdict, parameters) = match strongest {
            Action::Record => (Verdict::Record, Vec::new()),
            Action::Block { status_code } => (
                Verdict::Block,
                vec![
                    ("status_code".to_string(), status_code.to_string()),
                    ("type".to_string(), "auto".to_string()),
                ],
            ),
            Action::Redirect {
                status_code,
                location,
            } => (
                Verdict::Redirect,
                vec![
                    ("status_code".to_string(), status_code.to_string()),
                    ("location".to_string(), location),
                ],
            ),
        };

        let triggers = merged
            .events
            .iter()
            .filter_map(|event| serde_json::to_string(event).ok())
            .collect();

        // Sampling admission only happens when something was raised.
        let force_keep = merged.keep || self.limiter.allow();

        PublishResult {
            verdict,
            parameters,
            triggers,
            derived: merged.derived,
            force_keep,
        }
    }

    /// Accounting across every listener this context created.
    pub fn stats(&self) -> ContextStats {
        let mut stats = ContextStats {
            ruleset_version: self.generation.ruleset_version().map(str::to_string),
            ..ContextStats::default()
        };
        for listener in self.listeners.iter().flatten() {
            let s = listener.stats();
            stats.duration_us += s.duration_us;
            stats.timeouts += s.timeouts;
        }
        stats
    }

    /// Generation this context was created against.
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    /// Number of inputs retained so far.
    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::{
        DetectionEvent, Detector, DetectorError, ListenerStats, NoopDetector,
    };
    use crate::engine::Engine;
    use crate::remote_config::Changeset;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detector that counts observations and raises on demand.
    struct Probe {
        addresses: Vec<String>,
        observed: Arc<AtomicUsize>,
        raise: bool,
        fail: bool,
        keep: bool,
    }

    impl Probe {
        fn new(raise: bool) -> (Arc<Self>, Arc<AtomicUsize>) {
            let observed = Arc::new(AtomicUsize::new(0));
            let probe = Arc::new(Self {
                addresses: vec!["server.request.query".to_string()],
                observed: Arc::clone(&observed),
                raise,
                fail: false,
                keep: raise,
            });
            (probe, observed)
        }
    }

    impl Detector for Probe {
        fn name(&self) -> &str {
            "probe"
        }
        fn addresses(&self) -> &[String] {
            &self.addresses
        }
        fn products(&self) -> &[String] {
            &[]
        }
        fn listener(&self) -> Box<dyn Listener> {
            Box::new(ProbeListener {
                observed: Arc::clone(&self.observed),
                raise: self.raise,
                fail: self.fail,
                keep: self.keep,
            })
        }
        fn with_changes(&self, _c: &Changeset) -> Result<Arc<dyn Detector>, DetectorError> {
            Err(DetectorError::Config("probe does not reload".into()))
        }
    }

    struct ProbeListener {
        observed: Arc<AtomicUsize>,
        raise: bool,
        fail: bool,
        keep: bool,
    }

    impl Listener for ProbeListener {
        fn observe(
            &mut self,
            _input: &Value,
            _scope: Option<&str>,
        ) -> Result<ListenerOutcome, DetectorError> {
            self.observed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DetectorError::Internal("boom".into()));
            }
            let mut outcome = ListenerOutcome::default();
            if self.raise {
                outcome.events.push(DetectionEvent {
                    rule_id: "r1".into(),
                    rule_name: "probe rule".into(),
                    tags: Default::default(),
                    address: "server.request.query".into(),
                    matched: "x".into(),
                });
                outcome.keep = self.keep;
            }
            Ok(outcome)
        }
        fn stats(&self) -> ListenerStats {
            ListenerStats::default()
        }
    }

    fn engine_with(probe: Arc<Probe>) -> Engine {
        let engine = Engine::new(Arc::new(RateLimiter::new(100)));
        engine.subscribe(probe);
        engine
    }

    fn query_input() -> Value {
        Value::Map(vec![(
            Value::from("server.request.query"),
            Value::from("payload"),
        )])
    }

    #[test]
    fn non_map_input_fails_without_listener_calls() {
        let (probe, observed) = Probe::new(true);
        let engine = engine_with(probe);
        let mut ctx = engine.context();

        let err = ctx
            .publish(Value::from("scalar"), None, false)
            .expect_err("must fail");
        assert!(matches!(err, PublishError::NotAMap));
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.retained_len(), 0);
    }

    #[test]
    fn quiet_publish_returns_none_and_retains_input() {
        let (probe, observed) = Probe::new(false);
        let engine = engine_with(probe);
        let mut ctx = engine.context();

        let result = ctx.publish(query_input(), None, false).expect("publish");
        assert!(result.is_none());
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.retained_len(), 1);
    }

    #[test]
    fn ephemeral_publish_is_not_retained() {
        let (probe, _) = Probe::new(false);
        let engine = engine_with(probe);
        let mut ctx = engine.context();

        ctx.publish(query_input(), Some("rule-1"), true)
            .expect("publish");
        assert_eq!(ctx.retained_len(), 0);
    }

    #[test]
    fn raised_events_default_to_record_with_keep() {
        let (probe, _) = Probe::new(true);
        let engine = engine_with(probe);
        let mut ctx = engine.context();

        let result = ctx
            .publish(query_input(), None, false)
            .expect("publish")
            .expect("raised");
        assert_eq!(result.verdict, Verdict::Record);
        assert_eq!(result.triggers.len(), 1);
        assert!(result.force_keep);
    }

    #[test]
    fn failing_listener_does_not_abort_the_others() {
        let observed = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(Probe {
            addresses: vec!["a".into()],
            observed: Arc::clone(&observed),
            raise: false,
            fail: true,
            keep: false,
        });
        let (raising, raised_count) = Probe::new(true);

        let engine = Engine::new(Arc::new(RateLimiter::new(100)));
        engine.subscribe(failing);
        engine.subscribe(raising);

        let mut ctx = engine.context();
        let result = ctx
            .publish(query_input(), None, false)
            .expect("publish")
            .expect("second listener still raised");
        assert_eq!(result.verdict, Verdict::Record);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(raised_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_generation_allows_everything() {
        let engine = Engine::new(Arc::new(RateLimiter::new(100)));
        engine.subscribe(Arc::new(NoopDetector));
        let mut ctx = engine.context();

        let result = ctx.publish(query_input(), None, false).expect("publish");
        assert!(result.is_none());
        assert!(!engine.is_armed());
    }
}
