//! Wire Codec
//!
//! Canonical JSON encoding for domain values. Non-primitive values carry an
//! explicit `$type` marker so that mappings with non-string keys, sets,
//! sequences, opaque identifiers and timestamps survive a round trip.
//!
//! Decoding never instantiates domain types: a record tag that is not in the
//! closed whitelist comes back as a plain [`Value::Record`], and only an
//! explicit [`Structured::from_value`] call can turn it into a domain object.

pub mod hash;

pub use hash::structural_hash;

use crate::error::CodecError;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Structural type tags used on the wire.
pub mod tags {
    pub const DATETIME: &str = "datetime";
    pub const ID: &str = "id";
    pub const SEQ: &str = "seq";
    pub const SET: &str = "set";
    pub const MAP: &str = "map";

    /// Tags reserved for structural containers; everything else names a record.
    pub const STRUCTURAL: &[&str] = &[DATETIME, ID, SEQ, SET, MAP];
}

/// A domain value in its canonical structural form.
///
/// All composite domain types flatten to this shape before hitting the wire
/// or the structural hash. Ordering is total (no floats) so values can key
/// sets and maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    /// Timezone-aware instant, canonicalized to UTC microseconds.
    Timestamp(DateTime<Utc>),
    /// Opaque identifier (uuids and the like); distinct from Text on the wire.
    Opaque(String),
    Sequence(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<Value, Value>),
    /// Composite record: a type tag over an ordered field-name -> value mapping.
    Record {
        tag: String,
        fields: BTreeMap<String, Value>,
    },
}

impl Value {
    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    pub fn opaque(s: impl Into<String>) -> Value {
        Value::Opaque(s.into())
    }

    pub fn record<I>(tag: &str, fields: I) -> Value
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Value::Record {
            tag: tag.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn sequence<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Sequence(items.into_iter().collect())
    }

    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Set(items.into_iter().collect())
    }

    pub fn map<I: IntoIterator<Item = (Value, Value)>>(items: I) -> Value {
        Value::Map(items.into_iter().collect())
    }

    /// Borrow record fields, checking the tag.
    pub fn as_record(&self, tag: &str) -> Result<&BTreeMap<String, Value>, CodecError> {
        match self {
            Value::Record { tag: t, fields } if t == tag => Ok(fields),
            other => Err(CodecError::UnexpectedShape {
                expected: "record",
                actual: format!("{:?} (wanted tag {})", other.kind(), tag),
            }),
        }
    }

    pub fn as_text(&self) -> Result<&str, CodecError> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(CodecError::UnexpectedShape {
                expected: "text",
                actual: other.kind().to_string(),
            }),
        }
    }

    pub fn as_int(&self) -> Result<i64, CodecError> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(CodecError::UnexpectedShape {
                expected: "int",
                actual: other.kind().to_string(),
            }),
        }
    }

    pub fn as_opaque(&self) -> Result<&str, CodecError> {
        match self {
            Value::Opaque(s) => Ok(s),
            other => Err(CodecError::UnexpectedShape {
                expected: "id",
                actual: other.kind().to_string(),
            }),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<Value, Value>, CodecError> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(CodecError::UnexpectedShape {
                expected: "map",
                actual: other.kind().to_string(),
            }),
        }
    }

    pub fn as_set(&self) -> Result<&BTreeSet<Value>, CodecError> {
        match self {
            Value::Set(s) => Ok(s),
            other => Err(CodecError::UnexpectedShape {
                expected: "set",
                actual: other.kind().to_string(),
            }),
        }
    }

    pub fn as_sequence(&self) -> Result<&[Value], CodecError> {
        match self {
            Value::Sequence(items) => Ok(items),
            other => Err(CodecError::UnexpectedShape {
                expected: "seq",
                actual: other.kind().to_string(),
            }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "datetime",
            Value::Opaque(_) => "id",
            Value::Sequence(_) => "seq",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Record { .. } => "record",
        }
    }
}

/// Domain types that flatten to a canonical [`Value`].
///
/// The set of implementors is the closed whitelist of record tags; there is
/// no reflective serialization of arbitrary attributes.
pub trait Structured: Sized {
    /// Record tag this type encodes under.
    const TAG: &'static str;

    fn to_value(&self) -> Value;
    fn from_value(value: &Value) -> Result<Self, CodecError>;
}

/// Encode a value to canonical JSON bytes.
///
/// Object keys are emitted sorted, so encoding is deterministic for equal
/// values.
pub fn encode(value: &Value) -> Vec<u8> {
    let json = to_json(value);
    // serde_json objects are BTreeMaps here, so serialization cannot fail.
    serde_json::to_vec(&json).expect("canonical JSON serialization is infallible")
}

/// Decode canonical JSON bytes back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let json: serde_json::Value = serde_json::from_slice(bytes)?;
    from_json(&json)
}

fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Text(s) => json!(s),
        Value::Timestamp(ts) => json!({
            "$type": tags::DATETIME,
            "value": ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        }),
        Value::Opaque(s) => json!({ "$type": tags::ID, "value": s }),
        Value::Sequence(items) => json!({
            "$type": tags::SEQ,
            "items": items.iter().map(to_json).collect::<Vec<_>>(),
        }),
        Value::Set(items) => json!({
            "$type": tags::SET,
            "items": items.iter().map(to_json).collect::<Vec<_>>(),
        }),
        Value::Map(entries) => json!({
            "$type": tags::MAP,
            "items": entries
                .iter()
                .map(|(k, v)| vec![to_json(k), to_json(v)])
                .collect::<Vec<_>>(),
        }),
        Value::Record { tag, fields } => {
            let mut obj = serde_json::Map::new();
            obj.insert("$type".to_string(), json!(tag));
            let mut field_obj = serde_json::Map::new();
            for (name, v) in fields {
                field_obj.insert(name.clone(), to_json(v));
            }
            obj.insert("fields".to_string(), serde_json::Value::Object(field_obj));
            serde_json::Value::Object(obj)
        }
    }
}

fn from_json(json: &serde_json::Value) -> Result<Value, CodecError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| CodecError::UnsupportedNumber(n.to_string())),
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        // Bare arrays never come off our own encoder but are accepted for
        // leniency with hand-written documents.
        serde_json::Value::Array(items) => Ok(Value::Sequence(
            items.iter().map(from_json).collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(obj) => {
            let tag = obj
                .get("$type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| CodecError::MalformedTag("object without $type".to_string()))?;
            match tag {
                t if t == tags::DATETIME => {
                    let raw = obj
                        .get("value")
                        .and_then(|v| v.as_str())
                        .ok_or(CodecError::MissingField("value"))?;
                    let ts = DateTime::parse_from_rfc3339(raw)
                        .map_err(|e| CodecError::MalformedTag(format!("bad datetime: {}", e)))?;
                    Ok(Value::Timestamp(ts.with_timezone(&Utc)))
                }
                t if t == tags::ID => {
                    let raw = obj
                        .get("value")
                        .and_then(|v| v.as_str())
                        .ok_or(CodecError::MissingField("value"))?;
                    Ok(Value::Opaque(raw.to_string()))
                }
                t if t == tags::SEQ => Ok(Value::Sequence(
                    tagged_items(obj)?
                        .iter()
                        .map(from_json)
                        .collect::<Result<_, _>>()?,
                )),
                t if t == tags::SET => Ok(Value::Set(
                    tagged_items(obj)?
                        .iter()
                        .map(from_json)
                        .collect::<Result<_, _>>()?,
                )),
                t if t == tags::MAP => {
                    let mut entries = BTreeMap::new();
                    for pair in tagged_items(obj)? {
                        let pair = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                            CodecError::MalformedTag("map entry is not a pair".to_string())
                        })?;
                        entries.insert(from_json(&pair[0])?, from_json(&pair[1])?);
                    }
                    Ok(Value::Map(entries))
                }
                // Record tags, known or unknown, decode to a plain record.
                // Instantiating a domain type requires an explicit
                // Structured::from_value call against the closed table.
                record_tag => {
                    let raw_fields = obj
                        .get("fields")
                        .and_then(|f| f.as_object())
                        .ok_or(CodecError::MissingField("fields"))?;
                    let mut fields = BTreeMap::new();
                    for (name, v) in raw_fields {
                        fields.insert(name.clone(), from_json(v)?);
                    }
                    Ok(Value::Record {
                        tag: record_tag.to_string(),
                        fields,
                    })
                }
            }
        }
    }
}

fn tagged_items(obj: &serde_json::Map<String, serde_json::Value>) -> Result<&Vec<serde_json::Value>, CodecError> {
    match obj.get("items") {
        Some(serde_json::Value::Array(items)) => Ok(items),
        _ => Err(CodecError::MissingField("items")),
    }
}
