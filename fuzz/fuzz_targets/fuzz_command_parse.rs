#![no_main]

//! Fuzz target for command classification.
//!
//! # Goal
//! Verify that arbitrary decoded value trees never panic the
//! `[method, payload]` classifier, whatever their shape.

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use rmpv::Value;
use wardgate::protocol::parse_command;

/// Recursive value shape driven by unstructured fuzz input.
fn build_value(u: &mut Unstructured<'_>, depth: usize) -> arbitrary::Result<Value> {
    if depth == 0 || u.is_empty() {
        return Ok(Value::Nil);
    }
    Ok(match u8::arbitrary(u)? % 6 {
        0 => Value::Nil,
        1 => Value::from(bool::arbitrary(u)?),
        2 => Value::from(u64::arbitrary(u)?),
        3 => Value::from(String::arbitrary(u)?),
        4 => {
            let len = usize::from(u8::arbitrary(u)? % 4);
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(build_value(u, depth - 1)?);
            }
            Value::Array(items)
        }
        _ => {
            let len = usize::from(u8::arbitrary(u)? % 4);
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let key = Value::from(String::arbitrary(u)?);
                pairs.push((key, build_value(u, depth - 1)?));
            }
            Value::Map(pairs)
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    if let Ok(value) = build_value(&mut u, 4) {
        let _ = parse_command(value);
    }
});
