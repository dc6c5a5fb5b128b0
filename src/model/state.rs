//! Observed Cluster State
//!
//! `DeploymentState` is the control service's merged knowledge of what is
//! actually running. Per-node facts are grouped into independent field
//! groups; a group is either fully known or fully ignorant (`None`), never
//! partially known. Ignorance never overwrites prior knowledge; only an
//! explicit value or an explicit wipe does.

use super::{dataset_id_from_value, dataset_id_value, get_field, Application, Dataset, Manifestation};
use crate::codec::{Structured, Value};
use crate::error::CodecError;
use crate::types::{DatasetId, Era};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use uuid::Uuid;

/// Independent field groups of a [`NodeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    /// `applications` + `used_ports`
    Applications,
    /// `manifestations` + `paths` + `devices`
    Datasets,
    /// `era`
    Era,
}

/// Observed facts about one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub hostname: String,
    pub applications: Option<BTreeMap<String, Application>>,
    pub used_ports: Option<BTreeSet<u16>>,
    pub manifestations: Option<BTreeMap<DatasetId, Manifestation>>,
    pub paths: Option<BTreeMap<DatasetId, PathBuf>>,
    pub devices: Option<BTreeMap<DatasetId, PathBuf>>,
    pub era: Option<Era>,
}

impl NodeState {
    pub fn ignorant(hostname: &str) -> NodeState {
        NodeState {
            hostname: hostname.to_string(),
            ..NodeState::default()
        }
    }

    /// Whether a field group is fully known.
    pub fn knows(&self, group: FieldGroup) -> bool {
        match group {
            FieldGroup::Applications => self.applications.is_some(),
            FieldGroup::Datasets => self.manifestations.is_some(),
            FieldGroup::Era => self.era.is_some(),
        }
    }

    /// True when no field group is known at all.
    pub fn is_ignorant(&self) -> bool {
        !self.knows(FieldGroup::Applications)
            && !self.knows(FieldGroup::Datasets)
            && !self.knows(FieldGroup::Era)
    }

    /// Enforce the all-or-none invariant within each field group.
    pub fn check_invariant(&self) -> Result<(), String> {
        if self.applications.is_some() != self.used_ports.is_some() {
            return Err(format!(
                "node {}: applications and used_ports must be known together",
                self.hostname
            ));
        }
        let datasets_known = self.manifestations.is_some();
        if self.paths.is_some() != datasets_known || self.devices.is_some() != datasets_known {
            return Err(format!(
                "node {}: manifestations, paths and devices must be known together",
                self.hostname
            ));
        }
        Ok(())
    }
}

/// Merged snapshot of observed cluster state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentState {
    /// Per-node observations keyed by hostname.
    pub nodes: BTreeMap<String, NodeState>,
    /// Datasets known to exist but not currently manifest on any node.
    pub nonmanifest_datasets: BTreeMap<DatasetId, Dataset>,
}

impl DeploymentState {
    pub fn node(&self, hostname: &str) -> Option<&NodeState> {
        self.nodes.get(hostname)
    }
}

/// A partial state update reported by a convergence agent.
///
/// This is the closed set of update variants: each one claims exactly one
/// field group on one node (plus, for dataset updates, any datasets the
/// agent saw that are manifest nowhere).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    NodeApplications {
        hostname: String,
        applications: BTreeMap<String, Application>,
        used_ports: BTreeSet<u16>,
    },
    NodeDatasets {
        hostname: String,
        manifestations: BTreeMap<DatasetId, Manifestation>,
        paths: BTreeMap<DatasetId, PathBuf>,
        devices: BTreeMap<DatasetId, PathBuf>,
        nonmanifest_datasets: BTreeMap<DatasetId, Dataset>,
    },
    NodeEra {
        hostname: String,
        era: Era,
    },
}

impl StateUpdate {
    pub fn hostname(&self) -> &str {
        match self {
            StateUpdate::NodeApplications { hostname, .. } => hostname,
            StateUpdate::NodeDatasets { hostname, .. } => hostname,
            StateUpdate::NodeEra { hostname, .. } => hostname,
        }
    }

    pub fn field_group(&self) -> FieldGroup {
        match self {
            StateUpdate::NodeApplications { .. } => FieldGroup::Applications,
            StateUpdate::NodeDatasets { .. } => FieldGroup::Datasets,
            StateUpdate::NodeEra { .. } => FieldGroup::Era,
        }
    }

    /// Fold this update into a snapshot. Only the claimed field group is
    /// touched; everything previously known about the node survives.
    pub fn apply_to(&self, state: &mut DeploymentState) {
        let node = state
            .nodes
            .entry(self.hostname().to_string())
            .or_insert_with(|| NodeState::ignorant(self.hostname()));
        match self {
            StateUpdate::NodeApplications {
                applications,
                used_ports,
                ..
            } => {
                node.applications = Some(applications.clone());
                node.used_ports = Some(used_ports.clone());
            }
            StateUpdate::NodeDatasets {
                manifestations,
                paths,
                devices,
                nonmanifest_datasets,
                ..
            } => {
                node.manifestations = Some(manifestations.clone());
                node.paths = Some(paths.clone());
                node.devices = Some(devices.clone());
                for (id, dataset) in nonmanifest_datasets {
                    state.nonmanifest_datasets.insert(*id, dataset.clone());
                }
            }
            StateUpdate::NodeEra { era, .. } => {
                node.era = Some(*era);
            }
        }
    }

    /// The wipe this update implies when its source goes stale.
    pub fn wipe(&self) -> Wipe {
        Wipe {
            hostname: self.hostname().to_string(),
            group: self.field_group(),
        }
    }
}

/// Removal of exactly the field group last contributed by one source.
///
/// Keyed by (hostname, group): two wipes with the same key are equivalent no
/// matter which data values produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Wipe {
    pub hostname: String,
    pub group: FieldGroup,
}

impl Wipe {
    /// Null out the wiped field group; drop the node entirely once nothing
    /// is known about it.
    pub fn apply_to(&self, state: &mut DeploymentState) {
        if let Some(node) = state.nodes.get_mut(&self.hostname) {
            match self.group {
                FieldGroup::Applications => {
                    node.applications = None;
                    node.used_ports = None;
                }
                FieldGroup::Datasets => {
                    node.manifestations = None;
                    node.paths = None;
                    node.devices = None;
                }
                FieldGroup::Era => {
                    node.era = None;
                }
            }
            if node.is_ignorant() {
                state.nodes.remove(&self.hostname);
            }
        }
    }
}

fn path_map_value(paths: &BTreeMap<DatasetId, PathBuf>) -> Value {
    Value::map(paths.iter().map(|(id, path)| {
        (
            dataset_id_value(id),
            Value::text(path.to_string_lossy().into_owned()),
        )
    }))
}

fn path_map_from_value(value: &Value) -> Result<BTreeMap<DatasetId, PathBuf>, CodecError> {
    let mut out = BTreeMap::new();
    for (k, v) in value.as_map()? {
        out.insert(dataset_id_from_value(k)?, v.as_text()?.into());
    }
    Ok(out)
}

fn manifestation_map_value(map: &BTreeMap<DatasetId, Manifestation>) -> Value {
    Value::map(
        map.iter()
            .map(|(id, m)| (dataset_id_value(id), m.to_value())),
    )
}

fn manifestation_map_from_value(
    value: &Value,
) -> Result<BTreeMap<DatasetId, Manifestation>, CodecError> {
    let mut out = BTreeMap::new();
    for (k, v) in value.as_map()? {
        out.insert(dataset_id_from_value(k)?, Manifestation::from_value(v)?);
    }
    Ok(out)
}

fn dataset_map_value(map: &BTreeMap<DatasetId, Dataset>) -> Value {
    Value::map(
        map.iter()
            .map(|(id, d)| (dataset_id_value(id), d.to_value())),
    )
}

fn dataset_map_from_value(value: &Value) -> Result<BTreeMap<DatasetId, Dataset>, CodecError> {
    let mut out = BTreeMap::new();
    for (k, v) in value.as_map()? {
        out.insert(dataset_id_from_value(k)?, Dataset::from_value(v)?);
    }
    Ok(out)
}

fn application_map_value(map: &BTreeMap<String, Application>) -> Value {
    Value::map(
        map.iter()
            .map(|(name, app)| (Value::text(name.clone()), app.to_value())),
    )
}

fn application_map_from_value(
    value: &Value,
) -> Result<BTreeMap<String, Application>, CodecError> {
    let mut out = BTreeMap::new();
    for (k, v) in value.as_map()? {
        out.insert(k.as_text()?.to_string(), Application::from_value(v)?);
    }
    Ok(out)
}

fn era_from_value(value: &Value) -> Result<Era, CodecError> {
    let raw = value.as_opaque()?;
    let uuid = Uuid::parse_str(raw)
        .map_err(|e| CodecError::MalformedTag(format!("bad era '{}': {}", raw, e)))?;
    Ok(Era(uuid))
}

impl Structured for NodeState {
    const TAG: &'static str = "NodeState";

    fn to_value(&self) -> Value {
        let opt = |v: Option<Value>| v.unwrap_or(Value::Null);
        Value::record(
            Self::TAG,
            [
                ("hostname", Value::text(self.hostname.clone())),
                (
                    "applications",
                    opt(self.applications.as_ref().map(application_map_value)),
                ),
                (
                    "used_ports",
                    opt(self.used_ports.as_ref().map(|ports| {
                        Value::set(ports.iter().map(|p| Value::Int(*p as i64)))
                    })),
                ),
                (
                    "manifestations",
                    opt(self.manifestations.as_ref().map(manifestation_map_value)),
                ),
                ("paths", opt(self.paths.as_ref().map(path_map_value))),
                ("devices", opt(self.devices.as_ref().map(path_map_value))),
                (
                    "era",
                    opt(self.era.map(|e| Value::opaque(e.0.to_string()))),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let non_null = |name: &'static str| -> Result<Option<&Value>, CodecError> {
            Ok(match get_field(fields, name)? {
                Value::Null => None,
                v => Some(v),
            })
        };
        let used_ports = match non_null("used_ports")? {
            None => None,
            Some(v) => {
                let mut ports = BTreeSet::new();
                for item in v.as_set()? {
                    let n = item.as_int()?;
                    ports.insert(u16::try_from(n).map_err(|_| {
                        CodecError::MalformedTag(format!("port {} out of range", n))
                    })?);
                }
                Some(ports)
            }
        };
        let node = NodeState {
            hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
            applications: non_null("applications")?
                .map(application_map_from_value)
                .transpose()?,
            used_ports,
            manifestations: non_null("manifestations")?
                .map(manifestation_map_from_value)
                .transpose()?,
            paths: non_null("paths")?.map(path_map_from_value).transpose()?,
            devices: non_null("devices")?.map(path_map_from_value).transpose()?,
            era: non_null("era")?.map(era_from_value).transpose()?,
        };
        // A document that splits a field group is rejected at the boundary,
        // never held in memory.
        node.check_invariant()
            .map_err(|reason| CodecError::UnexpectedShape {
                expected: Self::TAG,
                actual: reason,
            })?;
        Ok(node)
    }
}

impl Structured for DeploymentState {
    const TAG: &'static str = "DeploymentState";

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
                    "nonmanifest_datasets",
                    dataset_map_value(&self.nonmanifest_datasets),
                ),
            ],
        )
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let fields = value.as_record(Self::TAG)?;
        let mut nodes = BTreeMap::new();
        for (k, v) in get_field(fields, "nodes")?.as_map()? {
            nodes.insert(k.as_text()?.to_string(), NodeState::from_value(v)?);
        }
        Ok(DeploymentState {
            nodes,
            nonmanifest_datasets: dataset_map_from_value(get_field(
                fields,
                "nonmanifest_datasets",
            )?)?,
        })
    }
}

impl Structured for StateUpdate {
    const TAG: &'static str = "StateUpdate";

    fn to_value(&self) -> Value {
        match self {
            StateUpdate::NodeApplications {
                hostname,
                applications,
                used_ports,
            } => Value::record(
                "NodeApplicationsUpdate",
                [
                    ("hostname", Value::text(hostname.clone())),
                    ("applications", application_map_value(applications)),
                    (
                        "used_ports",
                        Value::set(used_ports.iter().map(|p| Value::Int(*p as i64))),
                    ),
                ],
            ),
            StateUpdate::NodeDatasets {
                hostname,
                manifestations,
                paths,
                devices,
                nonmanifest_datasets,
            } => Value::record(
                "NodeDatasetsUpdate",
                [
                    ("hostname", Value::text(hostname.clone())),
                    ("manifestations", manifestation_map_value(manifestations)),
                    ("paths", path_map_value(paths)),
                    ("devices", path_map_value(devices)),
                    (
                        "nonmanifest_datasets",
                        dataset_map_value(nonmanifest_datasets),
                    ),
                ],
            ),
            StateUpdate::NodeEra { hostname, era } => Value::record(
                "NodeEraUpdate",
                [
                    ("hostname", Value::text(hostname.clone())),
                    ("era", Value::opaque(era.0.to_string())),
                ],
            ),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        if let Ok(fields) = value.as_record("NodeApplicationsUpdate") {
            let mut used_ports = BTreeSet::new();
            for item in get_field(fields, "used_ports")?.as_set()? {
                let n = item.as_int()?;
                used_ports.insert(u16::try_from(n).map_err(|_| {
                    CodecError::MalformedTag(format!("port {} out of range", n))
                })?);
            }
            return Ok(StateUpdate::NodeApplications {
                hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
                applications: application_map_from_value(get_field(fields, "applications")?)?,
                used_ports,
            });
        }
        if let Ok(fields) = value.as_record("NodeDatasetsUpdate") {
            return Ok(StateUpdate::NodeDatasets {
                hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
                manifestations: manifestation_map_from_value(get_field(
                    fields,
                    "manifestations",
                )?)?,
                paths: path_map_from_value(get_field(fields, "paths")?)?,
                devices: path_map_from_value(get_field(fields, "devices")?)?,
                nonmanifest_datasets: dataset_map_from_value(get_field(
                    fields,
                    "nonmanifest_datasets",
                )?)?,
            });
        }
        let fields = value.as_record("NodeEraUpdate")?;
        Ok(StateUpdate::NodeEra {
            hostname: get_field(fields, "hostname")?.as_text()?.to_string(),
            era: era_from_value(get_field(fields, "era")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn applications_update(hostname: &str) -> StateUpdate {
        StateUpdate::NodeApplications {
            hostname: hostname.to_string(),
            applications: [(
                "postgres".to_string(),
                Application {
                    name: "postgres".to_string(),
                    image: "registry.example.com/postgres:latest".to_string(),
                    ports: BTreeSet::new(),
                    volume: None,
                },
            )]
            .into(),
            used_ports: [5432].into(),
        }
    }

    fn datasets_update(hostname: &str) -> StateUpdate {
        let id = DatasetId(Uuid::from_u128(3));
        StateUpdate::NodeDatasets {
            hostname: hostname.to_string(),
            manifestations: [(
                id,
                Manifestation {
                    dataset: Dataset {
                        dataset_id: id,
                        maximum_size: None,
                        deleted: false,
                    },
                    primary: true,
                },
            )]
            .into(),
            paths: [(id, PathBuf::from("/data/volumes"))].into(),
            devices: [(id, PathBuf::from("/dev/xvdf"))].into(),
            nonmanifest_datasets: BTreeMap::new(),
        }
    }

    #[test]
    fn test_updates_to_different_groups_merge_on_one_node() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        datasets_update("h1").apply_to(&mut state);
        let node = state.node("h1").unwrap();
        assert!(node.knows(FieldGroup::Applications));
        assert!(node.knows(FieldGroup::Datasets));
        node.check_invariant().unwrap();
    }

    #[test]
    fn test_update_does_not_erase_other_groups() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        // A datasets report carries no application knowledge and must not
        // disturb it.
        datasets_update("h1").apply_to(&mut state);
        assert!(state.node("h1").unwrap().applications.is_some());
    }

    #[test]
    fn test_wipe_clears_only_its_group() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        datasets_update("h1").apply_to(&mut state);
        applications_update("h1").wipe().apply_to(&mut state);
        let node = state.node("h1").unwrap();
        assert!(!node.knows(FieldGroup::Applications));
        assert!(node.knows(FieldGroup::Datasets));
    }

    #[test]
    fn test_wipe_of_last_group_drops_node() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        applications_update("h1").wipe().apply_to(&mut state);
        assert!(state.node("h1").is_none());
    }

    #[test]
    fn test_wipes_with_same_key_are_equal() {
        let a = applications_update("h1");
        let mut b = applications_update("h1");
        if let StateUpdate::NodeApplications { used_ports, .. } = &mut b {
            used_ports.insert(9999);
        }
        assert_ne!(a, b);
        assert_eq!(a.wipe(), b.wipe());
    }

    #[test]
    fn test_state_update_roundtrips_through_codec() {
        for update in [
            applications_update("h1"),
            datasets_update("h2"),
            StateUpdate::NodeEra {
                hostname: "h3".to_string(),
                era: Era(Uuid::from_u128(11)),
            },
        ] {
            let bytes = codec::encode(&update.to_value());
            let decoded = StateUpdate::from_value(&codec::decode(&bytes).unwrap()).unwrap();
            assert_eq!(decoded, update);
        }
    }

    #[test]
    fn test_partial_field_group_is_rejected_at_decode() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        let mut value = state.node("h1").unwrap().to_value();
        // applications known but used_ports null splits the group.
        if let Value::Record { fields, .. } = &mut value {
            fields.insert("used_ports".to_string(), Value::Null);
        }
        match NodeState::from_value(&value) {
            Err(CodecError::UnexpectedShape { .. }) => {}
            other => panic!("expected a rejected decode, got {:?}", other),
        }
    }

    #[test]
    fn test_deployment_state_roundtrips_through_codec() {
        let mut state = DeploymentState::default();
        applications_update("h1").apply_to(&mut state);
        datasets_update("h2").apply_to(&mut state);
        let bytes = codec::encode(&state.to_value());
        let decoded = DeploymentState::from_value(&codec::decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }
}
