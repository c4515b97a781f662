//! Typed commands and responses behind the wire framing.
//!
//! Every message on the wire is a `[method_name, payload]` pair. This
//! module classifies decoded pairs into [`ClientCommand`]s and renders
//! [`Response`]s back into value trees. Classification is strict about
//! shape (a malformed payload for a known method is its own error,
//! distinct from an unknown method) but lenient about optional settings,
//! which all carry defaults.

use std::path::PathBuf;
use std::time::Duration;

use rmpv::Value;
use thiserror::Error;

use crate::engine::ruleset::DEFAULT_EVAL_TIMEOUT;
use crate::engine::{ContextStats, PublishResult, Verdict};
use crate::limiter;
use crate::service::{EngineSettings, RemoteConfigSettings, ServiceIdentity};
use crate::wire::value::{map_get, map_get_bool, map_get_str, map_get_u64};

/// Method names, as they appear on the wire.
pub const METHOD_CLIENT_INIT: &str = "client_init";
pub const METHOD_REQUEST_INIT: &str = "request_init";
pub const METHOD_REQUEST_EXEC: &str = "request_exec";
pub const METHOD_CONFIG_SYNC: &str = "config_sync";
pub const METHOD_REQUEST_SHUTDOWN: &str = "request_shutdown";

/// Classification failures. All of them are answerable with the `error`
/// sentinel; none of them poison the transport.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message is not a [method, payload] pair")]
    NotAPair,

    #[error("unknown method '{method}'")]
    UnknownMethod { method: String },

    #[error("malformed {method} payload: {reason}")]
    BadPayload {
        method: &'static str,
        reason: &'static str,
    },
}

/// One command from the instrumented application.
#[derive(Debug)]
pub enum ClientCommand {
    ClientInit(Box<ClientInit>),
    RequestInit {
        input: Value,
    },
    RequestExec {
        scope: Option<String>,
        input: Value,
    },
    ConfigSync {
        path: Option<String>,
    },
    RequestShutdown {
        input: Value,
        sampling_key: Option<String>,
    },
}

impl ClientCommand {
    pub fn method(&self) -> &'static str {
        match self {
            ClientCommand::ClientInit(_) => METHOD_CLIENT_INIT,
            ClientCommand::RequestInit { .. } => METHOD_REQUEST_INIT,
            ClientCommand::RequestExec { .. } => METHOD_REQUEST_EXEC,
            ClientCommand::ConfigSync { .. } => METHOD_CONFIG_SYNC,
            ClientCommand::RequestShutdown { .. } => METHOD_REQUEST_SHUTDOWN,
        }
    }
}

/// Everything `client_init` declares about the reporting application.
#[derive(Debug)]
pub struct ClientInit {
    pub pid: u32,
    pub client_version: String,
    pub runtime_version: String,
    pub identity: ServiceIdentity,
    pub engine: EngineSettings,
    pub remote_config: RemoteConfigSettings,
    /// Explicit enable override; `None` defers to ruleset availability.
    pub enabled: Option<bool>,
}

/// Classify one decoded `[method, payload]` message.
pub fn parse_command(message: Value) -> Result<ClientCommand, ParseError> {
    let Value::Array(mut parts) = message else {
        return Err(ParseError::NotAPair);
    };
    if parts.len() != 2 {
        return Err(ParseError::NotAPair);
    }
    let payload = parts.remove(1);
    let Some(method) = parts[0].as_str() else {
        return Err(ParseError::NotAPair);
    };

    match method {
        METHOD_CLIENT_INIT => parse_client_init(payload),
        METHOD_REQUEST_INIT => Ok(ClientCommand::RequestInit { input: payload }),
        METHOD_REQUEST_EXEC => {
            let Value::Array(mut args) = payload else {
                return Err(ParseError::BadPayload {
                    method: METHOD_REQUEST_EXEC,
                    reason: "payload must be [rule_name, input]",
                });
            };
            if args.len() != 2 {
                return Err(ParseError::BadPayload {
                    method: METHOD_REQUEST_EXEC,
                    reason: "payload must be [rule_name, input]",
                });
            }
            let input = args.remove(1);
            let scope = args[0].as_str().map(str::to_string);
            Ok(ClientCommand::RequestExec { scope, input })
        }
        METHOD_CONFIG_SYNC => Ok(ClientCommand::ConfigSync {
            path: payload.as_str().map(str::to_string),
        }),
        METHOD_REQUEST_SHUTDOWN => {
            let Value::Array(mut args) = payload else {
                return Err(ParseError::BadPayload {
                    method: METHOD_REQUEST_SHUTDOWN,
                    reason: "payload must be [input, sampling_key?]",
                });
            };
            if args.is_empty() || args.len() > 2 {
                return Err(ParseError::BadPayload {
                    method: METHOD_REQUEST_SHUTDOWN,
                    reason: "payload must be [input, sampling_key?]",
                });
            }
            let sampling_key = if args.len() == 2 {
                args.remove(1).as_str().map(str::to_string)
            } else {
                None
            };
            let input = args.remove(0);
            Ok(ClientCommand::RequestShutdown {
                input,
                sampling_key,
            })
        }
        other => Err(ParseError::UnknownMethod {
            method: other.to_string(),
        }),
    }
}

fn parse_client_init(payload: Value) -> Result<ClientCommand, ParseError> {
    let bad = |reason: &'static str| ParseError::BadPayload {
        method: METHOD_CLIENT_INIT,
        reason,
    };

    if !payload.is_map() {
        return Err(bad("payload must be a map"));
    }

    let pid = map_get_u64(&payload, "pid").ok_or_else(|| bad("missing pid"))? as u32;
    let client_version = map_get_str(&payload, "client_version")
        .ok_or_else(|| bad("missing client_version"))?
        .to_string();
    let runtime_version = map_get_str(&payload, "runtime_version")
        .ok_or_else(|| bad("missing runtime_version"))?
        .to_string();

    let service = map_get(&payload, "service").ok_or_else(|| bad("missing service identity"))?;
    let identity = ServiceIdentity {
        service: map_get_str(service, "service")
            .ok_or_else(|| bad("missing service name"))?
            .to_string(),
        env: map_get_str(service, "env").unwrap_or_default().to_string(),
    };

    let engine = match map_get(&payload, "engine_settings") {
        Some(settings) => EngineSettings {
            rules_path: map_get_str(settings, "rules_path").map(PathBuf::from),
            eval_timeout: map_get_u64(settings, "eval_timeout_us")
                .map(Duration::from_micros)
                .unwrap_or(DEFAULT_EVAL_TIMEOUT),
            trace_rate_limit: map_get_u64(settings, "trace_rate_limit")
                .map(|v| v as u32)
                .unwrap_or(limiter::DEFAULT_RATE),
        },
        None => EngineSettings::default(),
    };

    let remote_config = match map_get(&payload, "remote_config") {
        Some(settings) => RemoteConfigSettings {
            enabled: map_get_bool(settings, "enabled").unwrap_or(false),
            manifest_path: map_get_str(settings, "manifest_path").map(PathBuf::from),
            poll_interval: map_get_u64(settings, "poll_interval_ms")
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_millis(1000)),
        },
        None => RemoteConfigSettings::default(),
    };

    let enabled = map_get_bool(&payload, "enabled");

    Ok(ClientCommand::ClientInit(Box::new(ClientInit {
        pid,
        client_version,
        runtime_version,
        identity,
        engine,
        remote_config,
        enabled,
    })))
}

/// One typed reply.
#[derive(Debug)]
pub enum Response {
    ClientInit {
        ok: bool,
        errors: Vec<String>,
        meta: Vec<(String, String)>,
        metrics: Vec<(String, f64)>,
    },
    /// Verdict reply; echoes the method it answers.
    Verdict {
        method: &'static str,
        verdict: Verdict,
        parameters: Vec<(String, String)>,
        triggers: Vec<String>,
        force_keep: bool,
        meta: Vec<(String, String)>,
        metrics: Vec<(String, f64)>,
    },
    ConfigFeatures {
        enabled: bool,
    },
    ConfigSyncAck,
    /// Sentinel sent whenever the actual request cannot be honored.
    Error,
}

impl Response {
    /// Build a verdict reply from a publish result (or its absence).
    pub fn verdict(method: &'static str, result: Option<PublishResult>) -> Self {
        match result {
            Some(result) => Response::Verdict {
                method,
                verdict: result.verdict,
                parameters: result.parameters,
                triggers: result.triggers,
                force_keep: result.force_keep,
                meta: Vec::new(),
                metrics: Vec::new(),
            },
            None => Response::Verdict {
                method,
                verdict: Verdict::Ok,
                parameters: Vec::new(),
                triggers: Vec::new(),
                force_keep: false,
                meta: Vec::new(),
                metrics: Vec::new(),
            },
        }
    }

    /// Attach request-end accounting to a verdict reply.
    pub fn with_stats(mut self, stats: &ContextStats) -> Self {
        if let Response::Verdict { meta, metrics, .. } = &mut self {
            if let Some(version) = &stats.ruleset_version {
                meta.push(("rules.version".to_string(), version.clone()));
            }
            metrics.push(("eval.duration_us".to_string(), stats.duration_us as f64));
            metrics.push(("eval.timeouts".to_string(), stats.timeouts as f64));
        }
        self
    }

    /// Attach one meta entry to a verdict reply.
    pub fn with_meta(mut self, key: &str, value: String) -> Self {
        if let Response::Verdict { meta, .. } = &mut self {
            meta.push((key.to_string(), value));
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::ClientInit { .. } => METHOD_CLIENT_INIT,
            Response::Verdict { method, .. } => *method,
            Response::ConfigFeatures { .. } => "config_features",
            Response::ConfigSyncAck => METHOD_CONFIG_SYNC,
            Response::Error => "error",
        }
    }

    /// Render the payload value tree.
    pub fn payload(&self) -> Value {
        match self {
            Response::ClientInit {
                ok,
                errors,
                meta,
                metrics,
            } => Value::Map(vec![
                (
                    Value::from("status"),
                    Value::from(if *ok { "ok" } else { "fail" }),
                ),
                (
                    Value::from("errors"),
                    Value::Array(errors.iter().map(|e| Value::from(e.as_str())).collect()),
                ),
                (Value::from("meta"), string_map(meta)),
                (Value::from("metrics"), metric_map(metrics)),
            ]),
            Response::Verdict {
                verdict,
                parameters,
                triggers,
                force_keep,
                meta,
                metrics,
                ..
            } => Value::Map(vec![
                (Value::from("verdict"), Value::from(verdict.as_str())),
                (Value::from("parameters"), string_map(parameters)),
                (
                    Value::from("triggers"),
                    Value::Array(triggers.iter().map(|t| Value::from(t.as_str())).collect()),
                ),
                (Value::from("force_keep"), Value::from(*force_keep)),
                (Value::from("meta"), string_map(meta)),
                (Value::from("metrics"), metric_map(metrics)),
            ]),
            Response::ConfigFeatures { enabled } => Value::Map(vec![(
                Value::from("enabled"),
                Value::from(*enabled),
            )]),
            Response::ConfigSyncAck => Value::Map(Vec::new()),
            Response::Error => Value::Map(Vec::new()),
        }
    }

    /// The `(name, payload)` pair handed to the broker.
    pub fn to_message(&self) -> (&'static str, Value) {
        (self.name(), self.payload())
    }
}

fn string_map(entries: &[(String, String)]) -> Value {
    Value::Map(
        entries
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}

fn metric_map(entries: &[(String, f64)]) -> Value {
    Value::Map(
        entries
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::F64(*v)))
            .collect(),
    )
}
