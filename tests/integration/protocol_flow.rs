//! End-to-end control protocol flows over in-memory streams

use super::test_utils::*;
use converge::model::Deployment;
use converge::protocol::service::{outbox_channel, serve_connection, ControlService};
use converge::protocol::AgentConnection;
use converge::types::SourceId;
use std::time::Duration;

async fn connected_agent(
    handle: converge::protocol::service::ControlServiceHandle,
) -> (
    AgentConnection,
    tokio::sync::mpsc::Receiver<converge::protocol::client::ClusterStatus>,
) {
    let (service_side, agent_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(serve_connection(handle, service_side));
    AgentConnection::connect(agent_side, Duration::from_secs(3600))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_one_report_fans_out_to_every_agent() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let (agent1, mut statuses1) = connected_agent(handle.clone()).await;
    let (_agent2, mut statuses2) = connected_agent(handle.clone()).await;
    statuses1.recv().await.unwrap();
    statuses2.recv().await.unwrap();

    agent1
        .send_state_report(vec![empty_applications_report("node-1")], None)
        .await
        .unwrap();

    // The fold reaches both the reporter and its peers.
    let status1 = statuses1.recv().await.unwrap();
    let status2 = statuses2.recv().await.unwrap();
    assert!(status1.state.nodes.contains_key("node-1"));
    assert!(status2.state.nodes.contains_key("node-1"));

    // One state-changing event means exactly one push; no duplicate follows.
    for statuses in [&mut statuses1, &mut statuses2] {
        let extra = tokio::time::timeout(Duration::from_millis(200), statuses.recv()).await;
        assert!(extra.is_err(), "a second status push followed one report");
    }
}

#[tokio::test]
async fn test_dead_connection_does_not_block_the_rest() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    // A connection whose outbox is already gone: every push to it fails.
    let (dead_outbox, dead_pushes) = outbox_channel();
    drop(dead_pushes);
    handle.attach_connection(dead_outbox).await;

    let (_agent, mut statuses) = connected_agent(handle.clone()).await;
    statuses.recv().await.unwrap();

    handle
        .report_state(
            SourceId::random(),
            vec![empty_applications_report("node-1")],
            None,
        )
        .await;

    // Delivery to the dead connection fails, the live agent still hears.
    let status = statuses.recv().await.unwrap();
    assert!(status.state.nodes.contains_key("node-1"));
}

#[tokio::test]
async fn test_trace_context_travels_with_the_broadcast() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let (agent, mut statuses) = connected_agent(handle.clone()).await;
    statuses.recv().await.unwrap();

    agent
        .send_state_report(
            vec![empty_applications_report("node-1")],
            Some("req-7f3a".to_string()),
        )
        .await
        .unwrap();

    let status = statuses.recv().await.unwrap();
    assert_eq!(status.trace_context.as_deref(), Some("req-7f3a"));
}
