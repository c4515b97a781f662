//! Per-identity services.
//!
//! A Service binds one detection engine to one reporting identity
//! (service name + environment). Identities are shared across
//! connections: every session reporting for the same identity drives the
//! same engine, so a ruleset hot-reload reaches all of them at once.
//!
//! Construction failures are captured, not raised: a service whose
//! ruleset cannot load still exists and still answers, with an inert
//! engine and the failure recorded for the `client_init` reply.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::engine::ruleset::{RulesetDetector, DEFAULT_EVAL_TIMEOUT};
use crate::engine::{Engine, NoopDetector};
use crate::limiter::{self, RateLimiter};
use crate::remote_config::{PollerHandle, ShmReader};

/// Stable identity a reporting application declares at init.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub service: String,
    pub env: String,
}

/// Engine construction settings from `client_init`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub rules_path: Option<PathBuf>,
    pub eval_timeout: Duration,
    pub trace_rate_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rules_path: None,
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            trace_rate_limit: limiter::DEFAULT_RATE,
        }
    }
}

/// Remote-config settings from `client_init`.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfigSettings {
    pub enabled: bool,
    pub manifest_path: Option<PathBuf>,
    pub poll_interval: Duration,
}

/// One identity's bound engine plus everything computed at init.
pub struct Service {
    pub identity: ServiceIdentity,
    pub engine: Arc<Engine>,
    /// Detection on/off for this identity, computed once.
    pub enabled: bool,
    /// Ruleset load failures captured at construction.
    pub init_errors: Vec<String>,
    /// Keeps the remote-config poller alive for the service's lifetime.
    _poller: Option<PollerHandle>,
}

impl Service {
    fn build(
        identity: ServiceIdentity,
        settings: &EngineSettings,
        remote: &RemoteConfigSettings,
        enabled_override: Option<bool>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.trace_rate_limit));
        let engine = Arc::new(Engine::new(limiter));
        let mut init_errors = Vec::new();

        match &settings.rules_path {
            Some(path) => match RulesetDetector::from_file(path, settings.eval_timeout) {
                Ok(detector) => {
                    info!(
                        service = %identity.service,
                        env = %identity.env,
                        rules = detector.rule_count(),
                        path = %path.display(),
                        "ruleset loaded"
                    );
                    engine.subscribe(Arc::new(detector));
                }
                Err(e) => {
                    warn!(
                        service = %identity.service,
                        path = %path.display(),
                        error = %e,
                        "ruleset load failed, service starts inert"
                    );
                    init_errors.push(e.to_string());
                    engine.subscribe(Arc::new(NoopDetector));
                }
            },
            None => {
                // No file configured: start with an empty ruleset that
                // remote configuration can arm later.
                match RulesetDetector::from_json(r#"{"rules": []}"#, settings.eval_timeout) {
                    Ok(detector) => engine.subscribe(Arc::new(detector)),
                    Err(e) => init_errors.push(e.to_string()),
                }
            }
        }

        let poller = match (remote.enabled, &remote.manifest_path) {
            (true, Some(manifest)) => Some(PollerHandle::spawn(
                Arc::clone(&engine),
                Box::new(ShmReader::new(manifest)),
                remote.poll_interval,
            )),
            (true, None) => {
                warn!(
                    service = %identity.service,
                    "remote config requested without a manifest path"
                );
                None
            }
            _ => None,
        };

        Self {
            identity,
            engine,
            enabled: enabled_override.unwrap_or(true),
            init_errors,
            _poller: poller,
        }
    }
}

/// Identity-keyed service store shared by every session.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<ServiceIdentity, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the service for one identity.
    ///
    /// Creation is serialized per identity by the map shard lock, so two
    /// sessions racing the same `client_init` observe one Service.
    pub fn get_or_create(
        &self,
        identity: &ServiceIdentity,
        settings: &EngineSettings,
        remote: &RemoteConfigSettings,
        enabled_override: Option<bool>,
    ) -> Arc<Service> {
        self.services
            .entry(identity.clone())
            .or_insert_with(|| {
                Arc::new(Service::build(
                    identity.clone(),
                    settings,
                    remote,
                    enabled_override,
                ))
            })
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
