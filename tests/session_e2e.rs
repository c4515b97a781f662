//! End-to-end session scenarios over a real Unix socket.
//!
//! Each test drives the full stack — acceptor, worker pool, session state
//! machine, wire framing, engine — exactly the way an instrumented
//! application would.

mod helpers;

use helpers::{clean_input, client_init_payload, field, sqli_input, Harness};
use rmpv::Value;
use wardgate::config::RuntimeConfig;
use wardgate::wire::frame_bytes;

#[test]
fn valid_ruleset_records_an_attack() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();

    let reply = client.client_init(Some(&rules), Some(true));
    assert_eq!(field(&reply, "status").as_str(), Some("ok"));
    assert_eq!(
        field(&reply, "errors").as_array().map(Vec::len),
        Some(0usize)
    );

    client.send("request_init", sqli_input());
    let (name, payload) = client.recv();
    assert_eq!(name, "request_init");
    assert_eq!(field(&payload, "verdict").as_str(), Some("record"));
    let triggers = field(&payload, "triggers").as_array().expect("triggers");
    assert!(!triggers.is_empty());
    let event = triggers[0].as_str().expect("json trigger");
    assert!(event.contains("sqli-001"));
    assert_eq!(field(&payload, "force_keep").as_bool(), Some(true));

    // Request end returns the cycle's accounting.
    client.send(
        "request_shutdown",
        Value::Array(vec![clean_input(), Value::from("session-key-1")]),
    );
    let (name, payload) = client.recv();
    assert_eq!(name, "request_shutdown");
    let metrics = field(&payload, "metrics").as_map().expect("metrics");
    assert!(metrics
        .iter()
        .any(|(k, _)| k.as_str() == Some("eval.duration_us")));
    let meta = field(&payload, "meta").as_map().expect("meta");
    assert!(meta.iter().any(|(k, _)| k.as_str() == Some("rules.version")));
}

#[test]
fn missing_ruleset_fails_init_but_keeps_serving() {
    let harness = Harness::start();
    let mut client = harness.connect();

    let bogus = harness.socket_path.with_file_name("nope.json");
    let reply = client.client_init(Some(&bogus), None);
    assert_eq!(field(&reply, "status").as_str(), Some("fail"));
    let errors = field(&reply, "errors").as_array().expect("errors");
    assert!(!errors.is_empty());

    // Detection is inert, not crashed: the attack input gets verdict ok.
    client.send("request_init", sqli_input());
    let (name, payload) = client.recv();
    assert_eq!(name, "request_init");
    assert_eq!(field(&payload, "verdict").as_str(), Some("ok"));
    assert_eq!(field(&payload, "force_keep").as_bool(), Some(false));
}

#[test]
fn oversized_body_gets_error_and_connection_survives() {
    let config = RuntimeConfig {
        max_body_bytes: 256,
        ..RuntimeConfig::default()
    };
    let harness = Harness::start_with(config);
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    // A correctly-framed body larger than the cap.
    let huge = Value::Map(vec![(
        Value::from("server.request.body"),
        Value::from("z".repeat(2048)),
    )]);
    client.send_raw(&frame_bytes(&[("request_init", &huge)]));
    let (name, _) = client.recv();
    assert_eq!(name, "error");

    // Exactly the declared bytes were discarded: the next command parses.
    client.send("config_sync", Value::Nil);
    let (name, payload) = client.recv();
    assert_eq!(name, "config_features");
    assert_eq!(field(&payload, "enabled").as_bool(), Some(true));
}

#[test]
fn racing_inits_share_one_consistent_service() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let rules = rules.clone();
        let mut client = harness.connect();
        handles.push(std::thread::spawn(move || {
            let reply = client.client_init(Some(&rules), Some(true));
            assert_eq!(field(&reply, "status").as_str(), Some("ok"));

            client.send("request_init", sqli_input());
            let (name, payload) = client.recv();
            assert_eq!(name, "request_init");
            field(&payload, "verdict").as_str().map(str::to_string)
        }));
    }

    for handle in handles {
        let verdict = handle.join().expect("client thread");
        assert_eq!(verdict.as_deref(), Some("record"));
    }
}

#[test]
fn explicit_disable_answers_with_features() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), Some(false));

    client.send("request_init", sqli_input());
    let (name, payload) = client.recv();
    assert_eq!(name, "config_features");
    assert_eq!(field(&payload, "enabled").as_bool(), Some(false));
}

#[test]
fn non_map_input_ends_the_session_after_error() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    client.send("request_init", Value::from("not a map"));
    let (name, _) = client.recv();
    assert_eq!(name, "error");
    assert!(client.is_closed());
}

#[test]
fn unknown_method_is_recoverable() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    client.send("reboot", Value::Nil);
    let (name, _) = client.recv();
    assert_eq!(name, "error");

    client.send("config_sync", Value::Nil);
    let (name, _) = client.recv();
    assert_eq!(name, "config_features");
}

#[test]
fn request_exec_scopes_to_one_rule() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    // Matches blk-001 in a full evaluation, but the scope pins sqli-001.
    let input = Value::Map(vec![(
        Value::from("server.request.uri"),
        Value::from("/admin/panel"),
    )]);
    client.send(
        "request_exec",
        Value::Array(vec![Value::from("sqli-001"), input.clone()]),
    );
    let (name, payload) = client.recv();
    assert_eq!(name, "request_exec");
    assert_eq!(field(&payload, "verdict").as_str(), Some("ok"));

    client.send(
        "request_exec",
        Value::Array(vec![Value::from("blk-001"), input]),
    );
    let (_, payload) = client.recv();
    assert_eq!(field(&payload, "verdict").as_str(), Some("block"));
    let parameters = field(&payload, "parameters").as_map().expect("parameters");
    assert!(parameters
        .iter()
        .any(|(k, v)| k.as_str() == Some("status_code") && v.as_str() == Some("403")));
}

#[test]
fn config_sync_reports_features_once_then_acks() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    client.send("config_sync", Value::from("datadir/config"));
    let (name, payload) = client.recv();
    assert_eq!(name, "config_features");
    assert_eq!(field(&payload, "enabled").as_bool(), Some(true));

    client.send("config_sync", Value::from("datadir/config"));
    let (name, _) = client.recv();
    assert_eq!(name, "config_sync");
}

#[test]
fn garbage_magic_closes_the_connection() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    client.send_raw(b"GET / HTTP/1.1\r\n");
    assert!(client.is_closed());
}

#[test]
fn bootstrap_requires_client_init_first() {
    let harness = Harness::start();
    let mut client = harness.connect();

    client.send("request_init", sqli_input());
    let (name, _) = client.recv();
    assert_eq!(name, "error");
    assert!(client.is_closed());
}

#[test]
fn second_client_init_is_rejected_but_not_fatal() {
    let harness = Harness::start();
    let rules = harness.ruleset_path();
    let mut client = harness.connect();
    client.client_init(Some(&rules), None);

    client.send("client_init", client_init_payload(Some(&rules), None));
    let (name, _) = client.recv();
    assert_eq!(name, "error");

    client.send("request_init", clean_input());
    let (name, payload) = client.recv();
    assert_eq!(name, "request_init");
    assert_eq!(field(&payload, "verdict").as_str(), Some("ok"));
}
