//! Cluster State Aggregator
//!
//! Merges partial, multi-source node reports into one observed-state
//! snapshot and expires contributions from sources that have gone quiet.
//!
//! Each wipe key (hostname + field group) is owned by the source that last
//! contributed it. Expiry of a source applies exactly the wipes it still
//! owns; a source that reports again before expiring loses nothing.

use crate::model::state::{DeploymentState, StateUpdate, Wipe};
use crate::types::{DatasetId, SourceId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Default inactivity window before a source's contributions are wiped.
pub const DEFAULT_EXPIRY_WINDOW_SECS: i64 = 60;

pub struct ClusterStateAggregator {
    state: DeploymentState,
    expiry_window: Duration,
    /// Last-activity instant per source.
    sources: HashMap<SourceId, DateTime<Utc>>,
    /// Current owner of each wipe key: only the last contributor's expiry
    /// clears a field group.
    owners: HashMap<Wipe, SourceId>,
}

impl ClusterStateAggregator {
    pub fn new(expiry_window: Duration) -> Self {
        ClusterStateAggregator {
            state: DeploymentState::default(),
            expiry_window,
            sources: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Merge updates without attributing them to any source. Used for
    /// internally generated state that should never be expired.
    pub fn apply_changes(&mut self, updates: &[StateUpdate]) {
        for update in updates {
            update.apply_to(&mut self.state);
        }
    }

    /// Merge updates from one source, refreshing its activity timestamp and
    /// recording ownership of each update's wipe key.
    pub fn apply_changes_from_source(&mut self, source: SourceId, updates: &[StateUpdate]) {
        self.apply_changes_from_source_at(source, updates, Utc::now());
    }

    pub fn apply_changes_from_source_at(
        &mut self,
        source: SourceId,
        updates: &[StateUpdate],
        now: DateTime<Utc>,
    ) {
        self.sources.insert(source, now);
        for update in updates {
            self.owners.insert(update.wipe(), source);
            update.apply_to(&mut self.state);
        }
    }

    /// Read-only lookup of a dataset's filesystem path on a node.
    pub fn manifestation_path(&self, hostname: &str, dataset_id: &DatasetId) -> Option<&PathBuf> {
        self.state
            .nodes
            .get(hostname)
            .and_then(|node| node.paths.as_ref())
            .and_then(|paths| paths.get(dataset_id))
    }

    /// The current merged, read-only snapshot.
    pub fn as_deployment_state(&self) -> DeploymentState {
        self.state.clone()
    }

    /// Wipe contributions of every source inactive for longer than the
    /// expiry window. Run roughly once per second by the service; returns
    /// whether any contribution was actually wiped, so an idle sweep costs
    /// nothing downstream.
    pub fn expire_stale(&mut self) -> bool {
        self.expire_stale_at(Utc::now())
    }

    pub fn expire_stale_at(&mut self, now: DateTime<Utc>) -> bool {
        let expired: Vec<SourceId> = self
            .sources
            .iter()
            .filter(|(_, last)| now - **last > self.expiry_window)
            .map(|(source, _)| *source)
            .collect();
        let mut wiped = false;
        for source in expired {
            debug!(%source, "expiring stale change source");
            self.sources.remove(&source);
            let owned: Vec<Wipe> = self
                .owners
                .iter()
                .filter(|(_, owner)| **owner == source)
                .map(|(wipe, _)| wipe.clone())
                .collect();
            for wipe in owned {
                wipe.apply_to(&mut self.state);
                self.owners.remove(&wipe);
                wiped = true;
            }
        }
        wiped
    }
}
