//! Stable serialization and fingerprints.
//!
//! Every hash that participates in dedup or idempotency goes through
//! [`stable_stringify`]: object keys sorted ascending, array order preserved,
//! JSON lexical form for strings, `null` for null. Map iteration order must
//! never leak into a fingerprint.

use serde_json::Value as JsonValue;
use sha2::Digest;
use sha2::Sha256;

use crate::util::truncate_bytes;

/// Canonical string form of a JSON-compatible value.
pub fn stable_stringify(value: &JsonValue) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => out.push_str(&n.to_string()),
        JsonValue::String(s) => {
            // serde_json's string serialization is the JSON lexical form.
            #[allow(clippy::unwrap_used)]
            out.push_str(&serde_json::to_string(s).unwrap());
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                #[allow(clippy::unwrap_used)]
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                #[allow(clippy::unwrap_used)]
                write_stable(map.get(*key).unwrap(), out);
            }
            out.push('}');
        }
    }
}

/// sha256 over [`stable_stringify`], lowercase hex.
pub fn stable_hash(value: &JsonValue) -> String {
    sha256_hex(&stable_stringify(value))
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        #[allow(clippy::unwrap_used)]
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

/// First `n` hex chars of sha256 over `input`. Used for rejected-proposal
/// ids (n = 8) and conversation summary hashes (n = 16).
pub fn short_hash(input: &str, n: usize) -> String {
    let mut hash = sha256_hex(input);
    hash.truncate(n);
    hash
}

/// Trim, lowercase and collapse internal whitespace. Canonical text form for
/// fingerprint cores so that whitespace-only edits reuse prior artifacts.
pub fn canonicalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

const EXCERPT_MAX_BYTES: usize = 200;

/// Diagnostic excerpt: control characters stripped, capped at 200 bytes.
/// Shared by every block parser for rejection records.
pub fn excerpt(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    truncate_bytes(&cleaned, EXCERPT_MAX_BYTES).to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn object_key_order_does_not_matter() {
        let a: JsonValue = serde_json::from_str(r#"{"a":1,"b":{"y":2,"x":3}}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"b":{"x":3,"y":2},"a":1}"#).unwrap();
        assert_eq!(stable_stringify(&a), stable_stringify(&b));
        assert_eq!(stable_hash(&a), stable_hash(&b));
    }

    #[test]
    fn array_order_is_preserved() {
        assert_ne!(
            stable_stringify(&json!([1, 2])),
            stable_stringify(&json!([2, 1]))
        );
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let v = json!({"z": "s", "a": [null, true, 1.5]});
        assert_eq!(stable_stringify(&v), r#"{"a":[null,true,1.5],"z":"s"}"#);
    }

    #[test]
    fn strings_use_json_lexical_form() {
        let v = json!({"k": "line\nbreak \"quoted\""});
        assert_eq!(stable_stringify(&v), r#"{"k":"line\nbreak \"quoted\""}"#);
    }

    #[test]
    fn short_hash_is_a_prefix_of_the_full_hash() {
        let full = sha256_hex("payload");
        assert_eq!(short_hash("payload", 8), full[..8]);
        assert_eq!(short_hash("payload", 16), full[..16]);
    }

    #[test]
    fn canonicalize_text_collapses_whitespace() {
        assert_eq!(canonicalize_text("  Foo\t\tBar  baz "), "foo bar baz");
    }

    #[test]
    fn excerpt_strips_control_chars_and_caps_length() {
        let noisy = format!("a\u{0007}b{}", "x".repeat(400));
        let e = excerpt(&noisy);
        assert!(e.starts_with("ab"));
        assert!(e.len() <= 200);
    }
}
