//! Integration harness: a real daemon (acceptor + pool + sessions) on a
//! temporary socket, plus a framed test client.
//!
//! Note: some helpers are provided for future test expansion and may not
//! be used by every test binary. They are marked `#[allow(dead_code)]`.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rmpv::Value;
use wardgate::config::RuntimeConfig;
use wardgate::pool::{run_acceptor, WorkerPool};
use wardgate::service::ServiceRegistry;
use wardgate::wire::{frame_bytes, DecodeLimits, Decoder, HEADER_LEN};

/// SQL-injection demo ruleset used across the end-to-end scenarios.
pub const RULESET_JSON: &str = r#"{
    "version": "1.7.0",
    "rules": [
        {
            "id": "sqli-001",
            "name": "SQL injection probe",
            "tags": {"type": "sql_injection", "category": "attack_attempt"},
            "conditions": [
                {
                    "operator": "match_regex",
                    "parameters": {
                        "inputs": ["server.request.query", "server.request.body"],
                        "regex": "(?i)'\\s*or\\s*'1'\\s*=\\s*'1"
                    }
                }
            ],
            "on_match": []
        },
        {
            "id": "blk-001",
            "name": "admin path block",
            "conditions": [
                {
                    "operator": "match_regex",
                    "parameters": {"inputs": ["server.request.uri"], "regex": "^/admin"}
                }
            ],
            "on_match": ["block"]
        }
    ]
}"#;

/// A daemon serving a temp socket for the duration of a test.
pub struct Harness {
    pub socket_path: PathBuf,
    pool: WorkerPool,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    dir: tempfile::TempDir,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(RuntimeConfig::default())
    }

    pub fn start_with(config: RuntimeConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("wardgate.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind");

        let registry = Arc::new(ServiceRegistry::new());
        let pool = WorkerPool::serving(registry, config);
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor_pool = pool.clone();
        let acceptor_flag = Arc::clone(&shutdown);
        let acceptor = std::thread::spawn(move || {
            let _ = run_acceptor(&listener, &acceptor_pool, &acceptor_flag);
        });

        Self {
            socket_path,
            pool,
            shutdown,
            acceptor: Some(acceptor),
            dir,
        }
    }

    /// Write the demo ruleset into the harness dir.
    pub fn ruleset_path(&self) -> PathBuf {
        let path = self.dir.path().join("rules.json");
        std::fs::write(&path, RULESET_JSON).expect("write ruleset");
        path
    }

    pub fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("timeout");
        TestClient { stream }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept so the flag is observed.
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        self.pool.shutdown(Duration::from_secs(2));
    }
}

/// Framed msgpack client speaking the daemon's wire protocol.
pub struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    pub fn send(&mut self, method: &str, payload: Value) {
        self.stream
            .write_all(&frame_bytes(&[(method, &payload)]))
            .expect("send frame");
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send raw");
    }

    /// Receive one frame; returns the first message as (name, payload).
    pub fn recv(&mut self) -> (String, Value) {
        self.try_recv().expect("response frame")
    }

    /// Receive one frame if the connection still yields one.
    pub fn try_recv(&mut self) -> Option<(String, Value)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).ok()?;
        let len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).ok()?;

        let mut decoder = Decoder::new(&body, DecodeLimits::default());
        let message = decoder.read_value().ok()?;
        let parts = message.as_array()?;
        let name = parts.first()?.as_str()?.to_string();
        let payload = parts.get(1).cloned().unwrap_or(Value::Nil);
        Some((name, payload))
    }

    /// Whether the server has closed this connection.
    pub fn is_closed(&mut self) -> bool {
        self.try_recv().is_none()
    }

    /// Standard `client_init` exchange; returns the reply payload.
    pub fn client_init(&mut self, rules_path: Option<&Path>, enabled: Option<bool>) -> Value {
        self.send("client_init", client_init_payload(rules_path, enabled));
        let (name, payload) = self.recv();
        assert_eq!(name, "client_init");
        payload
    }
}

/// Build a `client_init` payload for the test identity.
pub fn client_init_payload(rules_path: Option<&Path>, enabled: Option<bool>) -> Value {
    let mut engine_settings = vec![(
        Value::from("eval_timeout_us"),
        Value::from(10_000u64),
    )];
    if let Some(path) = rules_path {
        engine_settings.push((
            Value::from("rules_path"),
            Value::from(path.display().to_string()),
        ));
    }

    let mut payload = vec![
        (Value::from("pid"), Value::from(std::process::id() as u64)),
        (Value::from("client_version"), Value::from("0.9.0")),
        (Value::from("runtime_version"), Value::from("8.3.1")),
        (
            Value::from("service"),
            Value::Map(vec![
                (Value::from("service"), Value::from("checkout")),
                (Value::from("env"), Value::from("test")),
            ]),
        ),
        (Value::from("engine_settings"), Value::Map(engine_settings)),
    ];
    if let Some(enabled) = enabled {
        payload.push((Value::from("enabled"), Value::from(enabled)));
    }
    Value::Map(payload)
}

static NIL: Value = Value::Nil;

/// Map lookup on a reply payload.
pub fn field<'v>(payload: &'v Value, key: &str) -> &'v Value {
    payload
        .as_map()
        .and_then(|pairs| {
            pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v)
        })
        .unwrap_or(&NIL)
}

/// The canonical attack input from the demo ruleset's point of view.
pub fn sqli_input() -> Value {
    Value::Map(vec![(
        Value::from("server.request.query"),
        Value::Map(vec![(Value::from("a"), Value::from("1' OR '1'='1"))]),
    )])
}

/// A benign input no demo rule matches.
pub fn clean_input() -> Value {
    Value::Map(vec![(
        Value::from("server.request.query"),
        Value::Map(vec![(Value::from("a"), Value::from("hello"))]),
    )])
}
