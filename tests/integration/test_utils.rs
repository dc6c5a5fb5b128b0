//! Shared helpers for control-plane integration tests

use converge::codec::{structural_hash, Structured, Value};
use converge::model::state::{DeploymentState, StateUpdate};
use converge::model::{Application, Deployment, Node};
use converge::protocol::service::ControlServiceConfig;
use converge::protocol::wire::Envelope;
use converge::protocol::Command;
use converge::types::GenerationHash;
use std::collections::BTreeMap;
use std::time::Duration;

/// Service tuned for tests: keepalive effectively disabled so probes never
/// interleave with the envelopes under assertion.
pub fn quiet_service_config() -> ControlServiceConfig {
    ControlServiceConfig {
        expiry_window_secs: 3600,
        keepalive_interval: Duration::from_secs(3600),
        generation_capacity: 100,
    }
}

/// A one-node desired configuration.
pub fn deployment_with(hostname: &str, application: &str) -> Deployment {
    let mut deployment = Deployment::default();
    deployment.nodes.insert(
        hostname.to_string(),
        Node {
            hostname: hostname.to_string(),
            applications: BTreeMap::from([(
                application.to_string(),
                Application {
                    name: application.to_string(),
                    image: format!("registry.example.com/{}:latest", application),
                    ports: Default::default(),
                    volume: None,
                },
            )]),
            manifestations: BTreeMap::new(),
        },
    );
    deployment
}

/// An applications report claiming one empty node.
pub fn empty_applications_report(hostname: &str) -> StateUpdate {
    StateUpdate::NodeApplications {
        hostname: hostname.to_string(),
        applications: BTreeMap::new(),
        used_ports: Default::default(),
    }
}

/// Decode a pushed envelope into the cluster status it carries.
pub fn status_from_envelope(envelope: &Envelope) -> (Deployment, DeploymentState) {
    match envelope {
        Envelope::Request { command, args, .. } if command == "cluster_status" => {
            match Command::from_wire(command, args).unwrap() {
                Command::ClusterStatus {
                    configuration,
                    state,
                    ..
                } => (configuration, state),
                other => panic!("unexpected command: {:?}", other),
            }
        }
        other => panic!("expected a cluster_status push, got {:?}", other),
    }
}

/// The snapshot value a received status corresponds to.
pub fn status_snapshot(configuration: &Deployment, state: &DeploymentState) -> Value {
    Value::record(
        "ClusterStatusSnapshot",
        [
            ("configuration", configuration.to_value()),
            ("state", state.to_value()),
        ],
    )
}

/// The generation hash an observer derives from a received status.
pub fn status_generation(configuration: &Deployment, state: &DeploymentState) -> GenerationHash {
    structural_hash(&status_snapshot(configuration, state))
}
