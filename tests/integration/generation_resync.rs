//! Incremental resync through the generation tracker
//!
//! An observer that remembers the hash of a status it received can ask the
//! service for the composed diff up to the latest generation instead of
//! transferring a full snapshot.

use super::test_utils::*;
use converge::model::Deployment;
use converge::protocol::service::{outbox_channel, ControlService, ControlServiceConfig};
use converge::types::{GenerationHash, SourceId};
use std::time::Duration;

#[tokio::test]
async fn test_observer_catches_up_with_a_composed_diff() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let (outbox, mut pushes) = outbox_channel();
    let _source = handle.attach_connection(outbox).await;
    let (config0, state0) = status_from_envelope(&pushes.recv().await.unwrap());
    let gen0 = status_generation(&config0, &state0);

    handle
        .report_state(
            SourceId::random(),
            vec![empty_applications_report("h1")],
            None,
        )
        .await;
    let (config1, state1) = status_from_envelope(&pushes.recv().await.unwrap());
    let gen1 = status_generation(&config1, &state1);
    assert_ne!(gen0, gen1);

    // The diff from the old generation replays the observer to the latest
    // snapshot.
    let delta = handle.diff_from(gen0).await.unwrap();
    let replayed = delta.apply(&status_snapshot(&config0, &state0)).unwrap();
    assert_eq!(replayed, status_snapshot(&config1, &state1));

    // Holding the latest generation means nothing to apply.
    let delta = handle.diff_from(gen1).await.unwrap();
    assert!(delta.is_empty());
}

#[tokio::test]
async fn test_unknown_generation_forces_a_full_resync() {
    let (service, handle) = ControlService::new(quiet_service_config(), Deployment::default());
    tokio::spawn(service.run());

    let (outbox, mut pushes) = outbox_channel();
    handle.attach_connection(outbox).await;
    pushes.recv().await.unwrap();

    assert!(handle.diff_from(GenerationHash([0xab; 16])).await.is_none());
}

#[tokio::test]
async fn test_evicted_generation_forces_a_full_resync() {
    let config = ControlServiceConfig {
        generation_capacity: 2,
        expiry_window_secs: 3600,
        keepalive_interval: Duration::from_secs(3600),
    };
    let (service, handle) = ControlService::new(config, Deployment::default());
    tokio::spawn(service.run());

    let (outbox, mut pushes) = outbox_channel();
    handle.attach_connection(outbox).await;
    let (config0, state0) = status_from_envelope(&pushes.recv().await.unwrap());
    let gen0 = status_generation(&config0, &state0);

    // Four distinct generations push the first one out of the window.
    let mut generations = Vec::new();
    for hostname in ["h1", "h2", "h3", "h4"] {
        handle
            .report_state(
                SourceId::random(),
                vec![empty_applications_report(hostname)],
                None,
            )
            .await;
        let (configuration, state) = status_from_envelope(&pushes.recv().await.unwrap());
        generations.push(status_generation(&configuration, &state));
    }

    assert!(handle.diff_from(gen0).await.is_none());
    // The most recent still-cached generation remains reachable.
    assert!(handle.diff_from(generations[2]).await.is_some());
}
