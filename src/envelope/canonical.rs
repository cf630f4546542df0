//! Canonical JSON encoding and the envelope digest.
//!
//! Every signed message is hashed and signed over the canonical bytes of
//! its unsigned projection, so the encoding must be byte-for-byte
//! deterministic: object keys sorted by byte order, array order preserved,
//! strings minimally escaped, numbers in their shortest decimal form.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use serde_json::Value;

type Blake2b256 = Blake2b<U32>;

/// Serializes a JSON value into canonical bytes.
///
/// `serde_json::Map` preserves no particular order guarantee across
/// feature flags, so keys are re-sorted here regardless of how the value
/// was built. Scalars render through `serde_json` itself, which already
/// emits the shortest decimal form for numbers and minimal escaping for
/// strings.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value);
    out
}

/// BLAKE2b-256 digest of the canonical bytes, as lowercase hex.
pub fn canonical_digest_hex(value: &Value) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(canonical_bytes(value));
    hex::encode(hasher.finalize())
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
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
                write_value(out, &map[key.as_str()]);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    // serde_json escapes exactly the JSON-mandated set and nothing more.
    let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
    out.extend_from_slice(quoted.as_bytes());
}
