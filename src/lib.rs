//! wardgate - local detection sidecar for instrumented applications.
//!
//! Applications report per-request traffic telemetry over a Unix socket;
//! wardgate runs it through a hot-reloadable detection engine and answers
//! with a verdict (allow / record / block / redirect) plus diagnostics.
//!
//! # Architecture
//!
//! - **wire**: length-prefixed msgpack framing with strict decode limits.
//! - **protocol**: typed commands and responses behind the framing.
//! - **engine**: pub/sub detection engine; immutable ruleset generations
//!   swapped atomically so reloads never disturb in-flight requests.
//! - **session**: per-connection command state machine.
//! - **pool**: blocking acceptor plus a pool of reusable worker threads.
//! - **remote_config**: shared-memory-backed configuration deltas driving
//!   engine hot-reload.
//!
//! The rule-evaluation backend is pluggable via [`engine::Detector`]; the
//! built-in backend compiles a JSON ruleset of regex conditions.

pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod lock;
pub mod pool;
pub mod protocol;
pub mod remote_config;
pub mod service;
pub mod session;
pub mod wire;

/// Daemon version reported in `client_init` replies.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
