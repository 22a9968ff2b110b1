//! Cache key fingerprinting
//!
//! Derives a deterministic cache key from a logical query name and its
//! parameter set. Parameters are canonicalized before hashing: object keys
//! are emitted in sorted order at every depth, so two semantically equal
//! parameter maps always fingerprint identically regardless of how they
//! were built. Array order is preserved (it is semantically significant
//! for the queries this backend serves).
//!
//! Key layout: `"{query_name}:{hex(sha256)}"`. The query-name segment is
//! the key namespace, which is what generation bumps and prefix deletes
//! operate on.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the cache key for a logical query and its parameters.
pub fn fingerprint(query_name: &str, params: &Value) -> String {
    let canonical = canonicalize(params);

    let mut hasher = Sha256::new();
    hasher.update(query_name.as_bytes());
    // Separator byte keeps ("ab", "c") and ("a", "bc") distinct.
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());

    format!("{}:{}", query_name, hex::encode(hasher.finalize()))
}

/// Key prefix shared by all entries of a query namespace.
pub fn namespace_prefix(query_name: &str) -> String {
    format!("{}:", query_name)
}

/// Render a JSON value in canonical form: sorted object keys, no
/// whitespace, JSON string escaping.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // serde_json numbers keep their token identity, so 1 and 1.0
            // remain distinct inputs.
            out.push_str(&n.to_string());
        }
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                // Key came from the map, so the value is always present.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
