//! Cluster Data Model
//!
//! Desired configuration (`Deployment`) and its building blocks. These are
//! immutable in use: a configuration write replaces the whole `Deployment`.
//!
//! Every type here implements [`Structured`], which together forms the closed
//! whitelist of record tags the wire codec will hand to domain code.

pub mod state;

pub use state::{DeploymentState, FieldGroup, NodeState, StateUpdate, Wipe};

use crate::codec::{Structured, Value};
use crate::error::CodecError;
use crate::types::DatasetId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Desired cluster configuration: which applications and datasets live where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    /// Nodes keyed by hostname.
    pub nodes: BTreeMap<String, Node>,
    /// Dataset leases, keyed by dataset.
    pub leases: BTreeMap<DatasetId, Lease>,
}

/// One managed node in the desired configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub hostname: String,
    /// Applications keyed by name.
    pub applications: BTreeMap<String, Application>,
    /// Dataset manifestations that should exist on this node.
    pub manifestations: BTreeMap<DatasetId, Manifestation>,
}

/// A containerized application/service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Application {
    pub name: String,
    pub image: String,
    pub ports: BTreeSet<PortMap>,
    /// Dataset this application mounts, if any.
    pub volume: Option<AttachedVolume>,
}

/// Internal/external port mapping of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortMap {
    pub internal: u16,
    pub external: u16,
}

/// A dataset attached to an application at a mount point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttachedVolume {
    pub dataset_id: DatasetId,
    pub mountpoint: std::path::PathBuf,
}

/// A storage dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dataset {
    pub dataset_id: DatasetId,
    pub maximum_size: Option<i64>,
    pub deleted: bool,
}

/// A dataset's presence on a particular node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Manifestation {
    pub dataset: Dataset,
    /// Whether this copy is the writable primary.
    pub primary: bool,
}

/// A lease pinning a dataset to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub hostname: String,
    pub expires: Option<DateTime<Utc>>,
}

pub(crate) fn dataset_id_value(id: &DatasetId) -> Value {
    Value::opaque(id.0.to_string())
}

pub(crate) fn dataset_id_from_value(value: &Value) -> Result<DatasetId, CodecError> {
    let raw = value.as_opaque()?;
    let uuid = Uuid::parse_str(raw)
        .map_err(|e| CodecError::MalformedTag(format!("bad dataset id '{}': {}", raw, e)))?;
    Ok(DatasetId(uuid))
}

pub(crate) fn get_field<'a>(
    fields: &'a BTreeMap<String, Value>,
    name: &'static str,
) -> Result<&'a Value, CodecError> {
    fields.get(name).ok_or(CodecError::MissingField(name))
}

fn path_value(path: &std::path::Path) -> Value {
    Value::text(path.to_string_lossy().into_owned())
}

impl Structured for PortMap {
    const TAG: &'static str = "PortMap";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("internal", Value::Int(self.internal as i64)),
                ("external", Value::Int(self.external as i64)),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let port = |name| -> Result<u16, CodecError> {
            let n = get_field(fields, name)?.as_int()?;
            u16::try_from(n)
                .map_err(|_| CodecError::MalformedTag(format!("port {} out of range", n)))
        };
        Ok(PortMap {
            internal: port("internal")?,
            external: port("external")?,
        })
    }
}

impl Structured for AttachedVolume {
    const TAG: &'static str = "AttachedVolume";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("dataset_id", dataset_id_value(&self.dataset_id)),
                ("mountpoint", path_value(&self.mountpoint)),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        Ok(AttachedVolume {
            dataset_id: dataset_id_from_value(get_field(fields, "dataset_id")?)?,
            mountpoint: get_field(fields, "mountpoint")?.as_text()?.into(),
        })
    }
}

impl Structured for Application {
    const TAG: &'static str = "Application";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("name", Value::text(self.name.clone())),
                ("image", Value::text(self.image.clone())),
                ("ports", Value::set(self.ports.iter().map(Structured::to_value))),
                (
                    "volume",
                    self.volume
                        .as_ref()
                        .map(Structured::to_value)
                        .unwrap_or(Value::Null),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let ports = get_field(fields, "ports")?
            .as_set()?
            .iter()
            .map(PortMap::from_value)
            .collect::<Result<BTreeSet<_>, _>>()?;
        let volume = match get_field(fields, "volume")? {
            Value::Null => None,
            v => Some(AttachedVolume::from_value(v)?),
        };
        Ok(Application {
            name: get_field(fields, "name")?.as_text()?.to_string(),
            image: get_field(fields, "image")?.as_text()?.to_string(),
            ports,
            volume,
        })
    }
}

impl Structured for Dataset {
    const TAG: &'static str = "Dataset";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("dataset_id", dataset_id_value(&self.dataset_id)),
                (
                    "maximum_size",
                    self.maximum_size.map(Value::Int).unwrap_or(Value::Null),
                ),
                ("deleted", Value::Bool(self.deleted)),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let maximum_size = match get_field(fields, "maximum_size")? {
            Value::Null => None,
            v => Some(v.as_int()?),
        };
        Ok(Dataset {
            dataset_id: dataset_id_from_value(get_field(fields, "dataset_id")?)?,
            maximum_size,
            deleted: matches!(get_field(fields, "deleted")?, Value::Bool(true)),
        })
    }
}

impl Structured for Manifestation {
    const TAG: &'static str = "Manifestation";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("dataset", self.dataset.to_value()),
                ("primary", Value::Bool(self.primary)),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        Ok(Manifestation {
            dataset: Dataset::from_value(get_field(fields, "dataset")?)?,
            primary: matches!(get_field(fields, "primary")?, Value::Bool(true)),
        })
    }
}

impl Structured for Node {
    const TAG: &'static str = "Node";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("hostname", Value::text(self.hostname.clone())),
                (
                    "applications",
                    Value::map(
                        self.applications
                            .iter()
                            .map(|(name, app)| (Value::text(name.clone()), app.to_value())),
                    ),
                ),
                (
                    "manifestations",
                    Value::map(self.manifestations.iter().map(|(id, m)| {
                        (dataset_id_value(id), m.to_value())
                    })),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let mut applications = BTreeMap::new();
        for (k, v) in get_field(fields, "applications")?.as_map()? {
            applications.insert(k.as_text()?.to_string(), Application::from_value(v)?);
        }
        let mut manifestations = BTreeMap::new();
        for (k, v) in get_field(fields, "manifestations")?.as_map()? {
            manifestations.insert(dataset_id_from_value(k)?, Manifestation::from_value(v)?);
        }
        Ok(Node {
            hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
            applications,
            manifestations,
        })
    }
}

impl Structured for Lease {
    const TAG: &'static str = "Lease";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                ("hostname", Value::text(self.hostname.clone())),
                (
                    "expires",
                    self.expires.map(Value::Timestamp).unwrap_or(Value::Null),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let expires = match get_field(fields, "expires")? {
            Value::Null => None,
            Value::Timestamp(ts) => Some(*ts),
            other => {
                return Err(CodecError::UnexpectedShape {
                    expected: "datetime",
                    actual: format!("{:?}", other),
                })
            }
        };
        Ok(Lease {
            hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
            expires,
        })
    }
}

impl Structured for Deployment {
    const TAG: &'static str = "Deployment";

    fn to_value(&self) -> Value {
        Value::record(
            Self::TAG,
            [
                (
                    "nodes",
                    Value::map(
                        self.nodes
                            .iter()
                            .map(|(h, n)| (Value::text(h.clone()), n.to_value())),
                    ),
                ),
                (
                    "leases",
                    Value::map(self.leases.iter().map(|(id, lease)| {
                        (dataset_id_value(id), lease.to_value())
                    })),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let mut nodes = BTreeMap::new();
        for (k, v) in get_field(fields, "nodes")?.as_map()? {
            nodes.insert(k.as_text()?.to_string(), Node::from_value(v)?);
        }
        let mut leases = BTreeMap::new();
        for (k, v) in get_field(fields, "leases")?.as_map()? {
            leases.insert(dataset_id_from_value(k)?, Lease::from_value(v)?);
        }
        Ok(Deployment { nodes, leases })
    }
}
