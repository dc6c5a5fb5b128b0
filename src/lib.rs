//! Converge Cluster Control Plane
//!
//! The control service for a cluster of convergence agents: it persists the
//! desired deployment configuration, merges partial state reports from many
//! agents into one observed snapshot, and pushes both over an authenticated
//! wire protocol whenever either changes.
//!
//! # Architecture
//!
//! - [`codec`] / [`diff`]: canonical encoding, structural hashing and
//!   structural diffs over a closed model vocabulary
//! - [`model`]: desired configuration and observed state types
//! - [`aggregator`]: multi-source merge with per-source expiry
//! - [`generation`]: bounded content-addressed generation history for
//!   incremental resync
//! - [`persist`]: versioned on-disk configuration with migrations
//! - [`protocol`]: length-prefixed RPC between service and agents, with
//!   mutual TLS

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod generation;
pub mod logging;
pub mod model;
pub mod persist;
pub mod protocol;
pub mod types;
