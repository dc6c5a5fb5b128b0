//! Integration tests for the Converge control plane

mod configuration_fanout;
mod generation_resync;
mod protocol_flow;
mod state_aggregation;
mod test_utils;
