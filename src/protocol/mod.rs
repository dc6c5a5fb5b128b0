//! Control Protocol
//!
//! The authenticated RPC layer between the control service and its
//! convergence agents. Commands are a stable versioned contract; a major
//! version mismatch at handshake is fatal for that connection.

pub mod client;
pub mod service;
pub mod tls;
pub mod wire;

pub use client::AgentConnection;
pub use service::{ControlService, ControlServiceConfig, ControlServiceHandle};

use crate::codec::{self, Structured, Value};
use crate::error::{CodecError, ProtocolError};
use crate::model::state::{DeploymentState, StateUpdate};
use crate::model::Deployment;

/// Major protocol version. Incompatible changes to command names or argument
/// shapes bump this; a peer speaking a different major must not proceed.
pub const PROTOCOL_MAJOR_VERSION: u32 = 1;

/// A protocol command with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Compatibility check; the reply carries the responder's major version.
    Version,
    /// Liveness probe, sent periodically in both directions.
    NoOp,
    /// Control service → agent: desired configuration plus merged observed
    /// state, with a propagated trace token for cross-process correlation.
    ClusterStatus {
        configuration: Deployment,
        state: DeploymentState,
        trace_context: Option<String>,
    },
    /// Agent → control service: partial state updates.
    NodeState {
        state_changes: Vec<StateUpdate>,
        trace_context: Option<String>,
    },
}

/// Reply payload of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Version { major: u32 },
}

fn trace_value(trace_context: &Option<String>) -> Value {
    trace_context
        .as_ref()
        .map(|t| Value::text(t.clone()))
        .unwrap_or(Value::Null)
}

fn trace_from(fields: &std::collections::BTreeMap<String, Value>) -> Option<String> {
    match fields.get("trace_context") {
        Some(Value::Text(t)) => Some(t.clone()),
        _ => None,
    }
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::NoOp => "noop",
            Command::ClusterStatus { .. } => "cluster_status",
            Command::NodeState { .. } => "node_state",
        }
    }

    /// Encode the arguments as codec JSON for the envelope.
    pub fn to_args(&self) -> serde_json::Value {
        let value = match self {
            Command::Version => Value::record("VersionArgs", []),
            Command::NoOp => Value::record("NoOpArgs", []),
            Command::ClusterStatus {
                configuration,
                state,
                trace_context,
            } => Value::record(
                "ClusterStatusArgs",
                [
                    ("configuration", configuration.to_value()),
                    ("state", state.to_value()),
                    ("trace_context", trace_value(trace_context)),
                ],
            ),
            Command::NodeState {
                state_changes,
                trace_context,
            } => Value::record(
                "NodeStateArgs",
                [
                    (
                        "state_changes",
                        Value::sequence(state_changes.iter().map(Structured::to_value)),
                    ),
                    ("trace_context", trace_value(trace_context)),
                ],
            ),
        };
        codec_json(&value)
    }

    /// Decode a command from its wire name and codec-JSON arguments.
    pub fn from_wire(name: &str, args: &serde_json::Value) -> Result<Command, ProtocolError> {
        let value = value_from_json(args)?;
        match name {
            "version" => Ok(Command::Version),
            "noop" => Ok(Command::NoOp),
            "cluster_status" => {
                let fields = value.as_record("ClusterStatusArgs").map_err(bad_args)?;
                let configuration = fields
                    .get("configuration")
                    .ok_or(CodecError::MissingField("configuration"))
                    .map_err(bad_args)?;
                let state = fields
                    .get("state")
                    .ok_or(CodecError::MissingField("state"))
                    .map_err(bad_args)?;
                Ok(Command::ClusterStatus {
                    configuration: Deployment::from_value(configuration).map_err(bad_args)?,
                    state: DeploymentState::from_value(state).map_err(bad_args)?,
                    trace_context: trace_from(fields),
                })
            }
            "node_state" => {
                let fields = value.as_record("NodeStateArgs").map_err(bad_args)?;
                let changes = fields
                    .get("state_changes")
                    .ok_or(CodecError::MissingField("state_changes"))
                    .map_err(bad_args)?
                    .as_sequence()
                    .map_err(bad_args)?
                    .iter()
                    .map(StateUpdate::from_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(bad_args)?;
                Ok(Command::NodeState {
                    state_changes: changes,
                    trace_context: trace_from(fields),
                })
            }
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

impl Reply {
    pub fn to_result(&self) -> serde_json::Value {
        let value = match self {
            Reply::Empty => Value::record("EmptyResult", []),
            Reply::Version { major } => {
                Value::record("VersionResult", [("major", Value::Int(*major as i64))])
            }
        };
        codec_json(&value)
    }

    pub fn from_wire(result: &serde_json::Value) -> Result<Reply, ProtocolError> {
        let value = value_from_json(result)?;
        if let Ok(fields) = value.as_record("VersionResult") {
            let major = fields
                .get("major")
                .ok_or(CodecError::MissingField("major"))
                .map_err(bad_args)?
                .as_int()
                .map_err(bad_args)?;
            let major = u32::try_from(major).map_err(|_| {
                ProtocolError::MalformedFrame(format!("negative protocol version {}", major))
            })?;
            return Ok(Reply::Version { major });
        }
        value.as_record("EmptyResult").map_err(bad_args)?;
        Ok(Reply::Empty)
    }
}

fn bad_args(err: CodecError) -> ProtocolError {
    ProtocolError::Codec(err)
}

fn codec_json(value: &Value) -> serde_json::Value {
    // Round through the canonical encoder so the envelope carries exactly
    // the codec's JSON shape.
    serde_json::from_slice(&codec::encode(value)).expect("codec output is valid JSON")
}

fn value_from_json(json: &serde_json::Value) -> Result<Value, ProtocolError> {
    let bytes = serde_json::to_vec(json).map_err(CodecError::InvalidJson)?;
    Ok(codec::decode(&bytes)?)
}
