//! Generation Tracker
//!
//! A bounded FIFO of content-addressed generations. Each time the latest
//! value changes, the tracker records the previous generation's hash and the
//! diff leading to the new one; a stale observer holding any still-cached
//! generation hash can catch up with a composed diff instead of a full
//! snapshot.

use crate::codec::{structural_hash, Value};
use crate::diff::{diff, Diff};
use crate::types::GenerationHash;
use std::collections::VecDeque;

/// One cached generation: its hash and the diff to the generation after it.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub hash: GenerationHash,
    pub diff_to_next: Diff,
}

pub struct GenerationTracker {
    capacity: usize,
    records: VecDeque<GenerationRecord>,
    latest: Option<(GenerationHash, Value)>,
}

impl GenerationTracker {
    pub fn new(capacity: usize) -> Self {
        GenerationTracker {
            capacity,
            records: VecDeque::with_capacity(capacity),
            latest: None,
        }
    }

    /// The hash of the current latest value, if any.
    pub fn latest_hash(&self) -> Option<GenerationHash> {
        self.latest.as_ref().map(|(hash, _)| *hash)
    }

    /// Record `value` as the new latest generation.
    ///
    /// When the structural hash matches the current latest, only the current
    /// reference is refreshed: the queue does not grow and previously
    /// computed chains are untouched. Returns the generation hash.
    pub fn insert_latest(&mut self, value: &Value) -> GenerationHash {
        let hash = structural_hash(value);
        match self.latest.take() {
            Some((latest_hash, _)) if latest_hash == hash => {
                self.latest = Some((hash, value.clone()));
            }
            Some((latest_hash, latest_value)) => {
                if self.records.len() >= self.capacity {
                    self.records.pop_front();
                }
                self.records.push_back(GenerationRecord {
                    hash: latest_hash,
                    diff_to_next: diff(&latest_value, value),
                });
                self.latest = Some((hash, value.clone()));
            }
            None => {
                self.latest = Some((hash, value.clone()));
            }
        }
        hash
    }

    /// Compose the diff from the generation identified by `hash` up to the
    /// latest value.
    ///
    /// Returns an empty diff when `hash` is already the latest, and `None`
    /// when the generation was evicted or never seen; the caller must fall
    /// back to a full resync.
    pub fn diff_from_hash_to_latest(&self, hash: &GenerationHash) -> Option<Diff> {
        if self.latest_hash() == Some(*hash) {
            return Some(Diff::empty());
        }
        let start = self.records.iter().position(|record| record.hash == *hash)?;
        let mut composed = Diff::empty();
        for record in self.records.iter().skip(start) {
            composed = composed.compose(record.diff_to_next.clone());
        }
        Some(composed)
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;

    fn deployment(nodes: &[(&str, i64)]) -> Value {
        Value::record(
            "Deployment",
            [(
                "nodes",
                Value::map(nodes.iter().map(|(hostname, generation)| {
                    (
                        Value::text(*hostname),
                        Value::record(
                            "Node",
                            [
                                ("hostname", Value::text(*hostname)),
                                ("revision", Value::Int(*generation)),
                            ],
                        ),
                    )
                })),
            )],
        )
    }

    #[test]
    fn test_latest_hash_yields_empty_diff() {
        let mut tracker = GenerationTracker::new(10);
        let d = deployment(&[("h1", 1)]);
        let hash = tracker.insert_latest(&d);
        let delta = tracker.diff_from_hash_to_latest(&hash).unwrap();
        assert!(delta.is_empty());
        assert_eq!(delta.apply(&d).unwrap(), d);
    }

    #[test]
    fn test_unknown_hash_requires_full_resync() {
        let mut tracker = GenerationTracker::new(10);
        tracker.insert_latest(&deployment(&[("h1", 1)]));
        let never_seen = structural_hash(&deployment(&[("h9", 9)]));
        assert!(tracker.diff_from_hash_to_latest(&never_seen).is_none());
    }

    #[test]
    fn test_every_cached_generation_reaches_latest() {
        // Five related deployments, with d4 == d2.
        let d1 = deployment(&[("h1", 1)]);
        let d2 = deployment(&[("h1", 2)]);
        let d3 = deployment(&[("h1", 2), ("h2", 1)]);
        let d4 = d2.clone();
        let d5 = deployment(&[("h1", 3)]);

        let mut tracker = GenerationTracker::new(10);
        for d in [&d1, &d2, &d3, &d4, &d5] {
            tracker.insert_latest(d);
        }

        for d in [&d1, &d2, &d3, &d4, &d5] {
            let hash = structural_hash(d);
            let delta = tracker.diff_from_hash_to_latest(&hash).unwrap();
            assert_eq!(delta.apply(d).unwrap(), d5, "from {}", hash);
        }

        // Repeated re-insertion of the latest value changes nothing.
        let before = tracker.queue_len();
        tracker.insert_latest(&d5);
        tracker.insert_latest(&d5);
        assert_eq!(tracker.queue_len(), before);
        for d in [&d1, &d2, &d3, &d4, &d5] {
            let delta = tracker.diff_from_hash_to_latest(&structural_hash(d)).unwrap();
            assert_eq!(delta.apply(d).unwrap(), d5);
        }
    }

    #[test]
    fn test_eviction_forgets_oldest_generations() {
        let deployments: Vec<Value> = (1..=6).map(|i| deployment(&[("h1", i)])).collect();
        let mut tracker = GenerationTracker::new(4);
        for d in &deployments {
            tracker.insert_latest(d);
        }

        // d1 was evicted; d2 is still reachable.
        assert!(tracker
            .diff_from_hash_to_latest(&structural_hash(&deployments[0]))
            .is_none());
        let delta = tracker
            .diff_from_hash_to_latest(&structural_hash(&deployments[1]))
            .unwrap();
        assert_eq!(delta.apply(&deployments[1]).unwrap(), deployments[5]);

        // Re-inserting d1 pushes a new record and overwrites d2's slot.
        tracker.insert_latest(&deployments[0]);
        assert!(tracker
            .diff_from_hash_to_latest(&structural_hash(&deployments[1]))
            .is_none());
    }

    #[test]
    fn test_first_insert_creates_no_record() {
        let mut tracker = GenerationTracker::new(4);
        tracker.insert_latest(&deployment(&[("h1", 1)]));
        assert_eq!(tracker.queue_len(), 0);
    }
}
