//! Configuration Persistence
//!
//! The desired `Deployment` lives in a versioned JSON document on disk. On
//! startup an older document is upgraded through a sequential chain of
//! per-version migrations and rewritten before the service starts; a missing
//! link in that chain is a fatal startup error.
//!
//! `DeploymentStore` is the seam the control service consumes: `get`/`save`
//! plus change notification fan-out on every save.

use crate::codec::{self, Structured};
use crate::error::{CodecError, ConfigError};
use crate::model::Deployment;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

/// Version written by this build of the service.
pub const CURRENT_VERSION: u32 = 3;

type Migration = fn(serde_json::Value) -> Result<serde_json::Value, String>;

/// The v→v+1 migration for a stored version, when one exists.
fn migration_from(version: u32) -> Option<Migration> {
    match version {
        1 => Some(migrate_v1_to_v2),
        2 => Some(migrate_v2_to_v3),
        _ => None,
    }
}

/// v1 stored each node's applications as a sequence; v2 keys them by name.
fn migrate_v1_to_v2(mut doc: serde_json::Value) -> Result<serde_json::Value, String> {
    let nodes = doc
        .pointer_mut("/deployment/fields/nodes/items")
        .and_then(|v| v.as_array_mut())
        .ok_or("v1 document has no node table")?;
    for entry in nodes {
        let node = entry
            .as_array_mut()
            .and_then(|pair| pair.get_mut(1))
            .ok_or("v1 node entry is not a pair")?;
        let apps = node
            .pointer_mut("/fields/applications")
            .ok_or("v1 node has no applications")?;
        let items = apps
            .pointer("/items")
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or("v1 applications is not a sequence")?;
        let mut keyed = Vec::with_capacity(items.len());
        for app in items {
            let name = app
                .pointer("/fields/name")
                .and_then(|v| v.as_str())
                .ok_or("v1 application has no name")?
                .to_string();
            keyed.push(serde_json::json!([name, app]));
        }
        *apps = serde_json::json!({ "$type": "map", "items": keyed });
    }
    Ok(doc)
}

/// v3 introduces the lease table, empty by default.
fn migrate_v2_to_v3(mut doc: serde_json::Value) -> Result<serde_json::Value, String> {
    let fields = doc
        .pointer_mut("/deployment/fields")
        .and_then(|v| v.as_object_mut())
        .ok_or("v2 document has no deployment fields")?;
    fields
        .entry("leases")
        .or_insert_with(|| serde_json::json!({ "$type": "map", "items": [] }));
    Ok(doc)
}

fn document_version(doc: &serde_json::Value) -> Result<u32, ConfigError> {
    doc.get("version")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .ok_or_else(|| ConfigError::Invalid("document has no version".to_string()))
}

/// Upgrade a stored document to [`CURRENT_VERSION`].
///
/// Returns the upgraded document and whether any migration ran.
pub fn upgrade_document(
    mut doc: serde_json::Value,
) -> Result<(serde_json::Value, bool), ConfigError> {
    let mut version = document_version(&doc)?;
    if version > CURRENT_VERSION {
        return Err(ConfigError::VersionFromTheFuture {
            stored: version,
            current: CURRENT_VERSION,
        });
    }
    let mut migrated = false;
    while version < CURRENT_VERSION {
        let migrate = migration_from(version)
            .ok_or(ConfigError::MissingMigration(version, version + 1))?;
        doc = migrate(doc).map_err(|reason| ConfigError::MigrationFailed { version, reason })?;
        version += 1;
        doc["version"] = serde_json::json!(version);
        migrated = true;
        info!(from_version = version - 1, to_version = version, "migrated configuration document");
    }
    Ok((doc, migrated))
}

fn decode_deployment(doc: &serde_json::Value) -> Result<Deployment, ConfigError> {
    let payload = doc
        .get("deployment")
        .ok_or_else(|| ConfigError::Invalid("document has no deployment".to_string()))?;
    let bytes = serde_json::to_vec(payload).map_err(CodecError::InvalidJson)?;
    let value = codec::decode(&bytes)?;
    Ok(Deployment::from_value(&value)?)
}

fn encode_document(deployment: &Deployment) -> Result<serde_json::Value, ConfigError> {
    let bytes = codec::encode(&deployment.to_value());
    let payload: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(CodecError::InvalidJson)?;
    Ok(serde_json::json!({
        "version": CURRENT_VERSION,
        "deployment": payload,
    }))
}

/// Atomic write: temporary file then rename.
fn write_document(path: &Path, doc: &serde_json::Value) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let serialized = serde_json::to_vec_pretty(doc).map_err(CodecError::InvalidJson)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &serialized).map_err(|e| ConfigError::Write {
        path: temp_path.clone(),
        source: e,
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    Ok(())
}

/// Persistence seam consumed by the control service.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Current desired configuration.
    async fn get(&self) -> Deployment;

    /// Replace the desired configuration wholesale and notify subscribers.
    async fn save(&self, deployment: Deployment) -> Result<(), ConfigError>;
}

/// File-backed store over the versioned document.
pub struct FileDeploymentStore {
    path: PathBuf,
    current: watch::Sender<Deployment>,
}

impl FileDeploymentStore {
    /// Open (or initialize) the document at `path`, running any pending
    /// migrations and rewriting the upgraded document before returning.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let deployment = if path.exists() {
            let raw = fs::read(path).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            let doc: serde_json::Value =
                serde_json::from_slice(&raw).map_err(CodecError::InvalidJson)?;
            let (doc, migrated) = upgrade_document(doc)?;
            if migrated {
                write_document(path, &doc)?;
            }
            decode_deployment(&doc)?
        } else {
            info!(?path, "no configuration document found, initializing empty deployment");
            let deployment = Deployment::default();
            write_document(path, &encode_document(&deployment)?)?;
            deployment
        };
        let (current, _) = watch::channel(deployment);
        Ok(FileDeploymentStore {
            path: path.to_path_buf(),
            current,
        })
    }

    /// Subscribe to configuration changes. Every `save` publishes the new
    /// deployment to all receivers.
    pub fn subscribe(&self) -> watch::Receiver<Deployment> {
        self.current.subscribe()
    }
}

#[async_trait]
impl DeploymentStore for FileDeploymentStore {
    async fn get(&self) -> Deployment {
        self.current.borrow().clone()
    }

    async fn save(&self, deployment: Deployment) -> Result<(), ConfigError> {
        write_document(&self.path, &encode_document(&deployment)?)?;
        self.current.send_replace(deployment);
        Ok(())
    }
}
