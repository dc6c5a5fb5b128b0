//! Structural hashing for domain values using BLAKE3
//!
//! Produces a 128-bit content address with the property that structurally
//! equal values hash equal in any process. Distinct shapes are kept apart by
//! type discriminators and length prefixes: the integer 5 and the text "5"
//! differ, a set and a sequence of the same elements differ, and the empty
//! set, the empty string and a missing value all differ.
//!
//! Truncating BLAKE3 to 16 bytes leaves a negligible accidental collision
//! rate for cluster-sized inputs; this is a content address, not a security
//! boundary.

use super::Value;
use crate::types::GenerationHash;
use blake3::Hasher;
use chrono::SecondsFormat;

const MARKER_NULL: &[u8] = b"null";
const MARKER_BOOL: &[u8] = b"bool";
const MARKER_INT: &[u8] = b"int";
const MARKER_TEXT: &[u8] = b"text";
const MARKER_DATETIME: &[u8] = b"datetime";
const MARKER_ID: &[u8] = b"id";
const MARKER_SEQ: &[u8] = b"seq";
const MARKER_SET: &[u8] = b"set";
const MARKER_MAP: &[u8] = b"map";
const MARKER_RECORD: &[u8] = b"record";

/// Compute the structural hash of a value.
pub fn structural_hash(value: &Value) -> GenerationHash {
    GenerationHash(hash_value(value))
}

fn hash_value(value: &Value) -> [u8; 16] {
    let mut hasher = Hasher::new();
    match value {
        Value::Null => {
            hasher.update(MARKER_NULL);
        }
        Value::Bool(b) => {
            hasher.update(MARKER_BOOL);
            hasher.update(&[*b as u8]);
        }
        Value::Int(n) => {
            hasher.update(MARKER_INT);
            hasher.update(&n.to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update(MARKER_TEXT);
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Timestamp(ts) => {
            hasher.update(MARKER_DATETIME);
            hasher.update(
                ts.to_rfc3339_opts(SecondsFormat::Micros, true)
                    .as_bytes(),
            );
        }
        Value::Opaque(s) => {
            hasher.update(MARKER_ID);
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Sequence(items) => {
            // Ordered concatenation of child hashes: order matters.
            hasher.update(MARKER_SEQ);
            hasher.update(&(items.len() as u64).to_be_bytes());
            for item in items {
                hasher.update(&hash_value(item));
            }
        }
        Value::Set(items) => {
            // XOR of child hashes: order-independent by construction.
            hasher.update(MARKER_SET);
            hasher.update(&(items.len() as u64).to_be_bytes());
            let mut combined = [0u8; 16];
            for item in items {
                let child = hash_value(item);
                for (c, b) in combined.iter_mut().zip(child.iter()) {
                    *c ^= b;
                }
            }
            hasher.update(&combined);
        }
        Value::Map(entries) => {
            hasher.update(MARKER_MAP);
            hasher.update(&(entries.len() as u64).to_be_bytes());
            // BTreeMap iterates in key order, so this is deterministic.
            for (key, val) in entries {
                hasher.update(&hash_value(key));
                hasher.update(&hash_value(val));
            }
        }
        Value::Record { tag, fields } => {
            // A record hashes as its tag over an ordered field-name mapping.
            hasher.update(MARKER_RECORD);
            hasher.update(&(tag.len() as u64).to_be_bytes());
            hasher.update(tag.as_bytes());
            hasher.update(&(fields.len() as u64).to_be_bytes());
            for (name, val) in fields {
                hasher.update(&(name.len() as u64).to_be_bytes());
                hasher.update(name.as_bytes());
                hasher.update(&hash_value(val));
            }
        }
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    out
}
