//! Structural Diff Engine
//!
//! Computes minimal deltas between two structurally similar values and
//! applies them. The operation vocabulary is exactly `Set` and `Remove`:
//! `Set` on a missing map key inserts, so no separate add operation exists.
//!
//! A diff may only be applied to the value it was computed against (or an
//! equivalent reached via a prefix of the same chain); an incompatible base
//! surfaces as a [`DiffError`].

use crate::codec::{Structured, Value};
use crate::error::{CodecError, DiffError};
use std::collections::BTreeSet;

/// One step into a nested value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathSegment {
    /// Named field of a composite record.
    Field(String),
    /// Key of a mapping.
    Key(Value),
}

/// A single diff operation, applied at a path from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    /// Replace (or insert) the value at `path`.
    Set { path: Vec<PathSegment>, value: Value },
    /// Delete the entry at `path` from its parent mapping or record.
    Remove { path: Vec<PathSegment> },
}

/// An ordered list of operations transforming one value into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    ops: Vec<DiffOp>,
}

/// Compute the diff from `a` to `b`.
///
/// Matching composite records recurse field by field and mappings key by
/// key; anything else that differs is replaced wholesale at its path. For
/// two large structures differing in a small subset of entries the result is
/// proportional to the changed subset.
pub fn diff(a: &Value, b: &Value) -> Diff {
    let mut ops = Vec::new();
    diff_at(&mut ops, &mut Vec::new(), a, b);
    Diff { ops }
}

fn diff_at(ops: &mut Vec<DiffOp>, path: &mut Vec<PathSegment>, a: &Value, b: &Value) {
    if a == b {
        return;
    }
    match (a, b) {
        (
            Value::Record { tag: tag_a, fields: fields_a },
            Value::Record { tag: tag_b, fields: fields_b },
        ) if tag_a == tag_b => {
            let names: BTreeSet<&String> = fields_a.keys().chain(fields_b.keys()).collect();
            for name in names {
                match (fields_a.get(name.as_str()), fields_b.get(name.as_str())) {
                    (Some(va), Some(vb)) => {
                        path.push(PathSegment::Field(name.to_string()));
                        diff_at(ops, path, va, vb);
                        path.pop();
                    }
                    (None, Some(vb)) => {
                        let mut p = path.clone();
                        p.push(PathSegment::Field(name.to_string()));
                        ops.push(DiffOp::Set { path: p, value: vb.clone() });
                    }
                    (Some(_), None) => {
                        let mut p = path.clone();
                        p.push(PathSegment::Field(name.to_string()));
                        ops.push(DiffOp::Remove { path: p });
                    }
                    (None, None) => unreachable!("name drawn from union"),
                }
            }
        }
        (Value::Map(map_a), Value::Map(map_b)) => {
            let keys: BTreeSet<&Value> = map_a.keys().chain(map_b.keys()).collect();
            for key in keys {
                match (map_a.get(key), map_b.get(key)) {
                    (Some(va), Some(vb)) => {
                        path.push(PathSegment::Key((*key).clone()));
                        diff_at(ops, path, va, vb);
                        path.pop();
                    }
                    (None, Some(vb)) => {
                        let mut p = path.clone();
                        p.push(PathSegment::Key((*key).clone()));
                        ops.push(DiffOp::Set { path: p, value: vb.clone() });
                    }
                    (Some(_), None) => {
                        let mut p = path.clone();
                        p.push(PathSegment::Key((*key).clone()));
                        ops.push(DiffOp::Remove { path: p });
                    }
                    (None, None) => unreachable!("key drawn from union"),
                }
            }
        }
        // Differing shapes, differing record tags, and all leaf or
        // order-sensitive containers: coarse replacement.
        _ => ops.push(DiffOp::Set { path: path.clone(), value: b.clone() }),
    }
}

impl Diff {
    pub fn empty() -> Diff {
        Diff::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    /// Concatenate another diff after this one.
    pub fn compose(mut self, next: Diff) -> Diff {
        self.ops.extend(next.ops);
        self
    }

    /// Apply every operation in order to `base`, producing the new value.
    pub fn apply(&self, base: &Value) -> Result<Value, DiffError> {
        let mut current = base.clone();
        for op in &self.ops {
            match op {
                DiffOp::Set { path, value } => {
                    if path.is_empty() {
                        current = value.clone();
                    } else {
                        let (parent, last) = descend(&mut current, &path[..path.len() - 1])
                            .map(|p| (p, &path[path.len() - 1]))?;
                        set_child(parent, last, value.clone(), path.len() - 1)?;
                    }
                }
                DiffOp::Remove { path } => {
                    let last = path.last().ok_or_else(|| {
                        DiffError::IncompatibleBase("remove at root".to_string())
                    })?;
                    let parent = descend(&mut current, &path[..path.len() - 1])?;
                    remove_child(parent, last, path.len() - 1)?;
                }
            }
        }
        Ok(current)
    }
}

/// Walk `path` through records and mappings, returning the value it lands on.
fn descend<'a>(value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, DiffError> {
    let mut current = value;
    for (index, segment) in path.iter().enumerate() {
        current = match (segment, current) {
            (PathSegment::Field(name), Value::Record { fields, .. }) => {
                fields.get_mut(name).ok_or_else(|| DiffError::BadPath {
                    segment: index,
                    reason: format!("no field '{}'", name),
                })?
            }
            (PathSegment::Key(key), Value::Map(entries)) => {
                entries.get_mut(key).ok_or_else(|| DiffError::BadPath {
                    segment: index,
                    reason: "no such key".to_string(),
                })?
            }
            (_, other) => {
                return Err(DiffError::BadPath {
                    segment: index,
                    reason: format!("cannot descend into {:?}", shape_of(other)),
                })
            }
        };
    }
    Ok(current)
}

fn set_child(
    parent: &mut Value,
    segment: &PathSegment,
    value: Value,
    index: usize,
) -> Result<(), DiffError> {
    match (segment, parent) {
        (PathSegment::Field(name), Value::Record { fields, .. }) => {
            fields.insert(name.clone(), value);
            Ok(())
        }
        (PathSegment::Key(key), Value::Map(entries)) => {
            entries.insert(key.clone(), value);
            Ok(())
        }
        (_, other) => Err(DiffError::BadPath {
            segment: index,
            reason: format!("cannot set child of {:?}", shape_of(other)),
        }),
    }
}

fn remove_child(parent: &mut Value, segment: &PathSegment, index: usize) -> Result<(), DiffError> {
    match (segment, parent) {
        (PathSegment::Field(name), Value::Record { fields, .. }) => {
            fields.remove(name);
            Ok(())
        }
        (PathSegment::Key(key), Value::Map(entries)) => {
            entries.remove(key);
            Ok(())
        }
        (_, other) => Err(DiffError::BadPath {
            segment: index,
            reason: format!("cannot remove child of {:?}", shape_of(other)),
        }),
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
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

// Diffs travel over the wire alongside the values they transform.

impl Structured for PathSegment {
    const TAG: &'static str = "PathSegment";

    fn to_value(&self) -> Value {
        match self {
            PathSegment::Field(name) => {
                Value::record("PathField", [("name", Value::text(name.clone()))])
            }
            PathSegment::Key(key) => Value::record("PathKey", [("key", key.clone())]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        if let Ok(fields) = value.as_record("PathField") {
            let name = fields
                .get("name")
                .ok_or(CodecError::MissingField("name"))?
                .as_text()?;
            return Ok(PathSegment::Field(name.to_string()));
        }
        let fields = value.as_record("PathKey")?;
        let key = fields.get("key").ok_or(CodecError::MissingField("key"))?;
        Ok(PathSegment::Key(key.clone()))
    }
}

impl Structured for DiffOp {
    const TAG: &'static str = "DiffOp";

    fn to_value(&self) -> Value {
        let encode_path = |path: &[PathSegment]| {
            Value::sequence(path.iter().map(Structured::to_value))
        };
        match self {
            DiffOp::Set { path, value } => Value::record(
                "Set",
                [("path", encode_path(path)), ("value", value.clone())],
            ),
            DiffOp::Remove { path } => Value::record("Remove", [("path", encode_path(path))]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let decode_path = |v: &Value| -> Result<Vec<PathSegment>, CodecError> {
            v.as_sequence()?
                .iter()
                .map(PathSegment::from_value)
                .collect()
        };
        if let Ok(fields) = value.as_record("Set") {
            let path = decode_path(fields.get("path").ok_or(CodecError::MissingField("path"))?)?;
            let set_value = fields
                .get("value")
                .ok_or(CodecError::MissingField("value"))?
                .clone();
            return Ok(DiffOp::Set { path, value: set_value });
        }
        let fields = value.as_record("Remove")?;
        let path = decode_path(fields.get("path").ok_or(CodecError::MissingField("path"))?)?;
        Ok(DiffOp::Remove { path })
    }
}

impl Structured for Diff {
    const TAG: &'static str = "Diff";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [("ops", Value::sequence(self.ops.iter().map(Structured::to_value)))],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let ops = fields
            .get("ops")
            .ok_or(CodecError::MissingField("ops"))?
            .as_sequence()?
            .iter()
            .map(DiffOp::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Diff { ops })
    }
}
