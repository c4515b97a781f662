//! Receive-path micro-benchmark.
//!
//! Measures bounded decoding of representative `request_init` bodies, the
//! per-command hot path of every worker.
//!
//! # Usage
//! ```bash
//! cargo bench --bench frame_parse
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rmpv::Value;
use wardgate::wire::{frame_bytes, DecodeLimits, Decoder, HEADER_LEN};

/// Minimal query-only input (~80 bytes).
fn small_input() -> Value {
    Value::Map(vec![(
        Value::from("server.request.query"),
        Value::Map(vec![(Value::from("q"), Value::from("search term"))]),
    )])
}

/// Fuller request snapshot with headers and body fields (~1 KiB).
fn medium_input() -> Value {
    let headers: Vec<(Value, Value)> = (0..12)
        .map(|i| {
            (
                Value::from(format!("x-header-{i}")),
                Value::from("application/json; charset=utf-8"),
            )
        })
        .collect();
    Value::Map(vec![
        (
            Value::from("server.request.query"),
            Value::Map(vec![
                (Value::from("page"), Value::from("1")),
                (Value::from("sort"), Value::from("created_at desc")),
            ]),
        ),
        (Value::from("server.request.headers"), Value::Map(headers)),
        (
            Value::from("server.request.body"),
            Value::from("lorem ipsum dolor sit amet ".repeat(24)),
        ),
        (Value::from("server.request.uri"), Value::from("/api/v2/orders")),
    ])
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for (label, input) in [("small", small_input()), ("medium", medium_input())] {
        let frame = frame_bytes(&[("request_init", &input)]);
        group.bench_with_input(BenchmarkId::from_parameter(label), &frame, |b, frame| {
            b.iter(|| {
                let mut decoder = Decoder::new(&frame[HEADER_LEN..], DecodeLimits::default());
                decoder.read_value().expect("decode")
            });
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let input = medium_input();
    c.bench_function("frame_encode/medium", |b| {
        b.iter(|| frame_bytes(&[("request_init", &input)]));
    });
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
