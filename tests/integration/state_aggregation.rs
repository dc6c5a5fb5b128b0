//! Multi-source aggregation as seen through the service

use super::test_utils::*;
use converge::model::state::{FieldGroup, StateUpdate};
use converge::model::{Dataset, Deployment, Manifestation};
use converge::protocol::service::{serve_connection, ControlService};
use converge::protocol::AgentConnection;
use converge::types::{DatasetId, SourceId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

fn datasets_report(hostname: &str) -> StateUpdate {
    let id = DatasetId(Uuid::from_u128(7));
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

#[tokio::test]
async fn test_reports_from_different_sources_merge_on_one_node() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let applications_agent = SourceId::random();
    let datasets_agent = SourceId::random();
    handle
        .report_state(
            applications_agent,
            vec![empty_applications_report("h1")],
            None,
        )
        .await;
    handle
        .report_state(datasets_agent, vec![datasets_report("h1")], None)
        .await;

    let (_, state) = handle.current_state().await.unwrap();
    let node = state.node("h1").unwrap();
    assert!(node.knows(FieldGroup::Applications));
    assert!(node.knows(FieldGroup::Datasets));
    node.check_invariant().unwrap();
}

#[tokio::test]
async fn test_disconnect_leaves_contributions_to_age_out() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let (service_side, agent_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(serve_connection(handle.clone(), service_side));
    let (agent, mut statuses) = AgentConnection::connect(agent_side, Duration::from_secs(3600))
        .await
        .unwrap();
    statuses.recv().await.unwrap();

    agent
        .send_state_report(vec![empty_applications_report("h1")], None)
        .await
        .unwrap();
    statuses.recv().await.unwrap();

    // Hang up; the report must survive the disconnect, a reconnecting agent
    // would refresh it long before the expiry window runs out.
    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, state) = handle.current_state().await.unwrap();
    assert!(state.node("h1").is_some());
}
