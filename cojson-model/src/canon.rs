//! Canonical JSON encoding
//!
//! The single normative byte form: object keys sorted, UTF-8, no
//! insignificant whitespace, numbers as shortest round-trip decimal.
//! Chain hashes, header IDs, and the wire all hash or transmit exactly
//! these bytes, so two implementations must agree byte-for-byte.
//!
//! `serde_json::Value` cannot represent `NaN` or `±Infinity` (they are
//! rejected at `Number` construction), so the forbidden values are
//! unrepresentable here by construction.

use serde_json::Value;

/// Encode a JSON value into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Canonical form as a string, for wire frames and sidecar files.
pub fn canonical_string(value: &Value) -> String {
    // write_value only emits valid UTF-8
    String::from_utf8(canonical_bytes(value)).unwrap_or_default()
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        // serde_json renders numbers with itoa/ryu: shortest round-trip
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[*key]);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    // serde_json's escaping is the canonical one
    match serde_json::to_vec(s) {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(_) => unreachable!("string serialization is infallible"),
    }
}
