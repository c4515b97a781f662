//! Built-in regex ruleset backend.
//!
//! Rules come from a JSON document: each rule carries conditions
//! (`match_regex` over one or more subscribed addresses) and optional
//! `on_match` enforcement. The document compiles once into an immutable
//! [`CompiledRuleset`]; evaluation walks the published input under a
//! per-call deadline and reports deadline overruns as a condition, not an
//! error.
//!
//! Remote configuration replaces the whole document: the newest blob
//! routed to the `rules` product becomes the next compiled ruleset.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use rmpv::Value;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::detector::{
    Action, DetectionEvent, Detector, DetectorError, Listener, ListenerOutcome, ListenerStats,
};
use crate::remote_config::Changeset;
use crate::wire::value::map_get;

/// Remote-config product whose entries carry ruleset documents.
pub const PRODUCT_RULES: &str = "rules";

/// Default evaluation deadline per publish call.
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_micros(10_000);

#[derive(Debug, Error)]
pub enum RulesetError {
    #[error("cannot read ruleset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ruleset does not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("rule '{rule}' has an invalid regex: {source}")]
    Regex {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RulesetFile {
    #[serde(default)]
    version: Option<String>,
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    id: String,
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    conditions: Vec<ConditionSpec>,
    #[serde(default)]
    on_match: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionSpec {
    operator: String,
    parameters: ConditionParams,
}

#[derive(Debug, Deserialize)]
struct ConditionParams {
    inputs: Vec<String>,
    regex: String,
}

struct CompiledCondition {
    inputs: Vec<String>,
    regex: Regex,
}

struct CompiledRule {
    id: String,
    name: String,
    tags: BTreeMap<String, String>,
    conditions: Vec<CompiledCondition>,
    actions: Vec<Action>,
}

/// Immutable compiled form shared by the detector and its listeners.
pub struct CompiledRuleset {
    version: Option<String>,
    rules: Vec<CompiledRule>,
    addresses: Vec<String>,
}

impl CompiledRuleset {
    fn compile(file: RulesetFile) -> Result<Self, RulesetError> {
        let mut rules = Vec::with_capacity(file.rules.len());
        let mut addresses = BTreeSet::new();

        for spec in file.rules {
            let mut conditions = Vec::with_capacity(spec.conditions.len());
            let mut supported = true;
            for condition in spec.conditions {
                if condition.operator != "match_regex" {
                    warn!(
                        rule = %spec.id,
                        operator = %condition.operator,
                        "skipping rule with unsupported operator"
                    );
                    supported = false;
                    break;
                }
                let regex = Regex::new(&condition.parameters.regex).map_err(|source| {
                    RulesetError::Regex {
                        rule: spec.id.clone(),
                        source,
                    }
                })?;
                conditions.push(CompiledCondition {
                    inputs: condition.parameters.inputs,
                    regex,
                });
            }
            if !supported || conditions.is_empty() {
                continue;
            }

            for condition in &conditions {
                addresses.extend(condition.inputs.iter().cloned());
            }
            rules.push(CompiledRule {
                id: spec.id,
                name: spec.name,
                tags: spec.tags,
                actions: spec.on_match.iter().map(|s| parse_action(s)).collect(),
                conditions,
            });
        }

        Ok(Self {
            version: file.version,
            rules,
            addresses: addresses.into_iter().collect(),
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn parse_action(name: &str) -> Action {
    match name {
        "block" => Action::Block { status_code: 403 },
        "redirect" => Action::Redirect {
            status_code: 303,
            location: "/".to_string(),
        },
        _ => Action::Record,
    }
}

/// Regex ruleset behind the [`Detector`] boundary.
pub struct RulesetDetector {
    ruleset: Arc<CompiledRuleset>,
    products: Vec<String>,
    eval_timeout: Duration,
}

impl RulesetDetector {
    pub fn from_file(path: &Path, eval_timeout: Duration) -> Result<Self, RulesetError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RulesetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, eval_timeout)
    }

    pub fn from_json(raw: &str, eval_timeout: Duration) -> Result<Self, RulesetError> {
        let file: RulesetFile = serde_json::from_str(raw)?;
        let ruleset = CompiledRuleset::compile(file)?;
        debug!(
            rules = ruleset.rule_count(),
            version = ruleset.version.as_deref().unwrap_or("unversioned"),
            "compiled ruleset"
        );
        Ok(Self {
            ruleset: Arc::new(ruleset),
            products: vec![PRODUCT_RULES.to_string()],
            eval_timeout,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.ruleset.rule_count()
    }
}

impl Detector for RulesetDetector {
    fn name(&self) -> &str {
        "ruleset"
    }

    fn addresses(&self) -> &[String] {
        &self.ruleset.addresses
    }

    fn products(&self) -> &[String] {
        &self.products
    }

    fn listener(&self) -> Box<dyn Listener> {
        Box::new(RulesetListener {
            ruleset: Arc::clone(&self.ruleset),
            eval_timeout: self.eval_timeout,
            stats: ListenerStats::default(),
        })
    }

    fn with_changes(&self, changes: &Changeset) -> Result<Arc<dyn Detector>, DetectorError> {
        // Whole-document replacement: the newest blob for our product wins.
        let blob = changes
            .added_for_product(PRODUCT_RULES)
            .map(|(_, blob)| blob)
            .last();

        let Some(blob) = blob else {
            // Nothing addressed to us; carry the current ruleset forward.
            return Ok(Arc::new(Self {
                ruleset: Arc::clone(&self.ruleset),
                products: self.products.clone(),
                eval_timeout: self.eval_timeout,
            }));
        };

        let raw = std::str::from_utf8(blob)
            .map_err(|_| DetectorError::Config("ruleset blob is not UTF-8".to_string()))?;
        let next = Self::from_json(raw, self.eval_timeout)
            .map_err(|e| DetectorError::Config(e.to_string()))?;
        Ok(Arc::new(next))
    }

    fn ruleset_version(&self) -> Option<&str> {
        self.ruleset.version.as_deref()
    }
}

struct RulesetListener {
    ruleset: Arc<CompiledRuleset>,
    eval_timeout: Duration,
    stats: ListenerStats,
}

impl Listener for RulesetListener {
    fn observe(
        &mut self,
        input: &Value,
        scope: Option<&str>,
    ) -> Result<ListenerOutcome, DetectorError> {
        let start = Instant::now();
        let deadline = start + self.eval_timeout;
        let mut outcome = ListenerOutcome::default();

        for rule in &self.ruleset.rules {
            if let Some(scope) = scope {
                if rule.id != scope && rule.name != scope {
                    continue;
                }
            }
            if Instant::now() >= deadline {
                outcome.timed_out = true;
                self.stats.timeouts += 1;
                break;
            }
            if let Some((address, matched)) = rule_match(rule, input) {
                outcome.events.push(DetectionEvent {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    tags: rule.tags.clone(),
                    address,
                    matched,
                });
                outcome.actions.extend(rule.actions.iter().cloned());
                outcome.keep = true;
            }
        }

        self.stats.duration_us += start.elapsed().as_micros() as u64;
        Ok(outcome)
    }

    fn stats(&self) -> ListenerStats {
        self.stats
    }
}

/// A rule matches when every condition matches; a condition matches when
/// any string reachable under one of its input addresses matches the
/// regex. Returns the first matching (address, value) pair for the event.
fn rule_match(rule: &CompiledRule, input: &Value) -> Option<(String, String)> {
    let mut first: Option<(String, String)> = None;
    for condition in &rule.conditions {
        let mut hit = None;
        'inputs: for address in &condition.inputs {
            let Some(subtree) = map_get(input, address) else {
                continue;
            };
            let mut leaves = Vec::new();
            collect_strings(subtree, &mut leaves);
            for leaf in leaves {
                if condition.regex.is_match(leaf) {
                    hit = Some((address.clone(), leaf.to_string()));
                    break 'inputs;
                }
            }
        }
        match hit {
            Some(h) => {
                if first.is_none() {
                    first = Some(h);
                }
            }
            None => return None,
        }
    }
    first
}

/// String leaves of a decoded input subtree, in document order.
fn collect_strings<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) => {
            if let Some(text) = s.as_str() {
                out.push(text);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Map(pairs) => {
            for (_, v) in pairs {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}
