//! Persisted configuration changes reaching connected agents

use super::test_utils::*;
use converge::model::Deployment;
use converge::persist::{DeploymentStore, FileDeploymentStore};
use converge::protocol::service::{serve_connection, ControlService, ControlServiceHandle};
use converge::protocol::AgentConnection;
use std::time::Duration;
use tempfile::TempDir;

/// Wire a store to a service the way the daemon does: every save fans out
/// through the service as a configuration change.
fn forward_saves(store: &FileDeploymentStore, handle: ControlServiceHandle) {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let deployment = changes.borrow_and_update().clone();
            handle.configuration_changed(deployment).await;
        }
    });
}

#[tokio::test]
async fn test_saved_configuration_reaches_connected_agents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("current_configuration.json");
    let store = FileDeploymentStore::open(&path).unwrap();

    let (service, handle) = ControlService::new(quiet_service_config(), store.get().await);
    tokio::spawn(service.run());
    forward_saves(&store, handle.clone());

    let (service_side, agent_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(serve_connection(handle, service_side));
    let (_agent, mut statuses) = AgentConnection::connect(agent_side, Duration::from_secs(3600))
        .await
        .unwrap();
    let initial = statuses.recv().await.unwrap();
    assert!(initial.configuration.nodes.is_empty());

    store
        .save(deployment_with("node-1.example.com", "postgres"))
        .await
        .unwrap();

    let status = statuses.recv().await.unwrap();
    let node = status.configuration.nodes.get("node-1.example.com").unwrap();
    assert!(node.applications.contains_key("postgres"));
}

#[tokio::test]
async fn test_old_document_is_migrated_before_serving() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("current_configuration.json");

    // A version 1 document, as an old daemon would have written it:
    // applications as a sequence, no lease table.
    let v1 = serde_json::json!({
        "version": 1,
        "deployment": {
            "$type": "Deployment",
            "fields": {
                "nodes": {
                    "$type": "map",
                    "items": [[
                        "node-1.example.com",
                        {
                            "$type": "Node",
                            "fields": {
                                "hostname": "node-1.example.com",
                                "applications": {
                                    "$type": "seq",
                                    "items": [{
                                        "$type": "Application",
                                        "fields": {
                                            "name": "postgres",
                                            "image": "registry.example.com/postgres:latest",
                                            "ports": { "$type": "set", "items": [] },
                                            "volume": null
                                        }
                                    }]
                                },
                                "manifestations": { "$type": "map", "items": [] }
                            }
                        }
                    ]]
                }
            }
        }
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&v1).unwrap()).unwrap();

    let store = FileDeploymentStore::open(&path).unwrap();
    let (service, handle) = ControlService::new(quiet_service_config(), store.get().await);
    tokio::spawn(service.run());

    let (service_side, agent_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(serve_connection(handle, service_side));
    let (_agent, mut statuses) = AgentConnection::connect(agent_side, Duration::from_secs(3600))
        .await
        .unwrap();

    // The migrated configuration is what agents see from the first push.
    let status = statuses.recv().await.unwrap();
    let node = status.configuration.nodes.get("node-1.example.com").unwrap();
    assert_eq!(
        node.applications.get("postgres").unwrap().image,
        "registry.example.com/postgres:latest"
    );

    let deployment: Deployment = store.get().await;
    assert!(deployment.leases.is_empty());
}
