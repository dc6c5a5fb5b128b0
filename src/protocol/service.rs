//! Control Protocol Service
//!
//! Owns the live set of agent connections, the cluster state aggregator and
//! the generation tracker. All mutation happens on one event-loop task fed
//! by an mpsc channel, so there is no lock contention: connection readers,
//! writers and keepalive probes are child tasks that only talk to the loop
//! through messages.
//!
//! Broadcast is fire-and-forget per connection with a bounded outbox; a full
//! or closed outbox is logged and skipped, never allowed to stall the loop
//! or the other connections. Dead connections are detected by their reader
//! and the keepalive probe, not by broadcast failures.

use crate::aggregator::ClusterStateAggregator;
use crate::codec::{structural_hash, Structured, Value};
use crate::diff::Diff;
use crate::error::ProtocolError;
use crate::generation::GenerationTracker;
use crate::model::state::{DeploymentState, StateUpdate};
use crate::model::Deployment;
use crate::protocol::wire::{self, Envelope};
use crate::protocol::{Command, Reply, PROTOCOL_MAJOR_VERSION};
use crate::types::{GenerationHash, SourceId};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

/// Per-connection outbox depth. A slow agent that falls further behind than
/// this loses intermediate pushes; the next broadcast supersedes them.
const OUTBOX_CAPACITY: usize = 32;

/// Events queued to the service loop.
pub(crate) enum ServiceEvent {
    Connected {
        handle: ConnectionHandle,
    },
    Disconnected {
        id: SourceId,
    },
    StateReport {
        source: SourceId,
        changes: Vec<StateUpdate>,
        trace_context: Option<String>,
    },
    ConfigurationChanged(Deployment),
    GetState {
        reply: oneshot::Sender<(Deployment, DeploymentState)>,
    },
    GetDiff {
        hash: GenerationHash,
        reply: oneshot::Sender<Option<Diff>>,
    },
}

/// Live connection as seen by the service loop.
pub(crate) struct ConnectionHandle {
    id: SourceId,
    outbox: mpsc::Sender<Envelope>,
}

#[derive(Debug, Clone)]
pub struct ControlServiceConfig {
    pub expiry_window_secs: u64,
    pub keepalive_interval: Duration,
    pub generation_capacity: usize,
}

impl Default for ControlServiceConfig {
    fn default() -> Self {
        ControlServiceConfig {
            expiry_window_secs: crate::aggregator::DEFAULT_EXPIRY_WINDOW_SECS as u64,
            keepalive_interval: Duration::from_secs(30),
            generation_capacity: 100,
        }
    }
}

/// The service event loop. Construct with [`ControlService::new`], then
/// drive it with [`ControlService::run`] on its own task.
pub struct ControlService {
    events_rx: mpsc::Receiver<ServiceEvent>,
    aggregator: ClusterStateAggregator,
    tracker: GenerationTracker,
    configuration: Deployment,
    connections: HashMap<SourceId, ConnectionHandle>,
    next_request_id: u64,
}

/// Cheap clonable handle into the service loop.
#[derive(Clone)]
pub struct ControlServiceHandle {
    events: mpsc::Sender<ServiceEvent>,
    keepalive_interval: Duration,
}

impl ControlService {
    pub fn new(
        config: ControlServiceConfig,
        initial_configuration: Deployment,
    ) -> (ControlService, ControlServiceHandle) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let service = ControlService {
            events_rx,
            aggregator: ClusterStateAggregator::new(ChronoDuration::seconds(
                config.expiry_window_secs as i64,
            )),
            tracker: GenerationTracker::new(config.generation_capacity),
            configuration: initial_configuration,
            connections: HashMap::new(),
            next_request_id: 0,
        };
        let handle = ControlServiceHandle {
            events: events_tx,
            keepalive_interval: config.keepalive_interval,
        };
        (service, handle)
    }

    /// Run the event loop until every handle is dropped.
    pub async fn run(mut self) {
        let mut expiry = tokio::time::interval(Duration::from_secs(1));
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = expiry.tick() => self.expire(),
            }
        }
        debug!("control service loop finished");
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Connected { handle } => {
                info!(source = %handle.id, "agent connection registered");
                // A new connection immediately receives the current snapshot
                // without waiting for the next change.
                let command = self.status_command(None);
                self.send_to(&handle, &command);
                self.connections.insert(handle.id, handle);
            }
            ServiceEvent::Disconnected { id } => {
                // The connection leaves the broadcast set now; its state
                // contributions age out through the aggregator's expiry, so
                // a fast reconnect loses nothing.
                info!(source = %id, "agent connection removed");
                self.connections.remove(&id);
            }
            ServiceEvent::StateReport {
                source,
                changes,
                trace_context,
            } => {
                debug!(
                    %source,
                    updates = changes.len(),
                    trace = trace_context.as_deref().unwrap_or("-"),
                    "folding node state report"
                );
                // The fold completes before the broadcast starts.
                self.aggregator.apply_changes_from_source(source, &changes);
                self.broadcast(trace_context);
            }
            ServiceEvent::ConfigurationChanged(deployment) => {
                info!(nodes = deployment.nodes.len(), "desired configuration replaced");
                self.configuration = deployment;
                self.broadcast(None);
            }
            ServiceEvent::GetState { reply } => {
                let _ = reply.send((
                    self.configuration.clone(),
                    self.aggregator.as_deployment_state(),
                ));
            }
            ServiceEvent::GetDiff { hash, reply } => {
                let _ = reply.send(self.tracker.diff_from_hash_to_latest(&hash));
            }
        }
    }

    fn expire(&mut self) {
        // Idle ticks never rebuild or rehash the snapshot.
        if !self.aggregator.expire_stale() {
            return;
        }
        let snapshot = status_snapshot_value(
            &self.configuration,
            &self.aggregator.as_deployment_state(),
        );
        if self.tracker.latest_hash() != Some(structural_hash(&snapshot)) {
            debug!("stale sources expired, state changed");
            self.broadcast(None);
        }
    }

    fn status_command(&mut self, trace_context: Option<String>) -> Command {
        let state = self.aggregator.as_deployment_state();
        self.tracker
            .insert_latest(&status_snapshot_value(&self.configuration, &state));
        Command::ClusterStatus {
            configuration: self.configuration.clone(),
            state,
            trace_context,
        }
    }

    /// Push the current snapshot to every live connection. Failures are
    /// logged per connection and never interrupt delivery to the rest.
    fn broadcast(&mut self, trace_context: Option<String>) {
        let command = self.status_command(trace_context);
        let mut id = self.next_request_id;
        for handle in self.connections.values() {
            id += 1;
            let envelope = Envelope::Request {
                id,
                command: command.name().to_string(),
                args: command.to_args(),
            };
            if let Err(e) = handle.outbox.try_send(envelope) {
                warn!(source = %handle.id, error = %e, "dropping status push");
            }
        }
        self.next_request_id = id;
    }

    fn send_to(&mut self, handle: &ConnectionHandle, command: &Command) {
        self.next_request_id += 1;
        let envelope = Envelope::Request {
            id: self.next_request_id,
            command: command.name().to_string(),
            args: command.to_args(),
        };
        if let Err(e) = handle.outbox.try_send(envelope) {
            warn!(source = %handle.id, error = %e, "dropping send");
        }
    }
}

/// The structural value fed to the generation tracker on every broadcast.
fn status_snapshot_value(configuration: &Deployment, state: &DeploymentState) -> Value {
    Value::record(
        "ClusterStatusSnapshot",
        [
            ("configuration", configuration.to_value()),
            ("state", state.to_value()),
        ],
    )
}

impl ControlServiceHandle {
    /// Replace the desired configuration; triggers a broadcast.
    pub async fn configuration_changed(&self, deployment: Deployment) {
        let _ = self
            .events
            .send(ServiceEvent::ConfigurationChanged(deployment))
            .await;
    }

    /// Current desired configuration and merged observed state.
    pub async fn current_state(&self) -> Option<(Deployment, DeploymentState)> {
        let (reply, rx) = oneshot::channel();
        self.events.send(ServiceEvent::GetState { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Incremental resync: the composed diff from a previously observed
    /// generation to the latest snapshot, or `None` when the generation was
    /// evicted and a full resync is required.
    pub async fn diff_from(&self, hash: GenerationHash) -> Option<Diff> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ServiceEvent::GetDiff { hash, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Register an in-process connection: the service will push status
    /// envelopes into `outbox`, starting with an immediate snapshot.
    pub async fn attach_connection(&self, outbox: mpsc::Sender<Envelope>) -> SourceId {
        let id = SourceId::random();
        let _ = self
            .events
            .send(ServiceEvent::Connected {
                handle: ConnectionHandle { id, outbox },
            })
            .await;
        id
    }

    /// Remove a connection from the broadcast set. Its state contributions
    /// are left to age out.
    pub async fn detach_connection(&self, id: SourceId) {
        let _ = self.events.send(ServiceEvent::Disconnected { id }).await;
    }

    /// Fold a state report from `source`, then broadcast to every live
    /// connection.
    pub async fn report_state(
        &self,
        source: SourceId,
        changes: Vec<StateUpdate>,
        trace_context: Option<String>,
    ) {
        let _ = self
            .events
            .send(ServiceEvent::StateReport {
                source,
                changes,
                trace_context,
            })
            .await;
    }
}

/// Outbox capacity for connections created by [`serve_connection`].
pub fn outbox_channel() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
    mpsc::channel(OUTBOX_CAPACITY)
}

/// Drive one agent connection over any reliable ordered stream.
///
/// Spawns a writer task draining the bounded outbox and a keepalive task
/// probing with `NoOp`; both are cancelled when the reader finishes. The
/// connection's change source is registered with the service loop for the
/// duration of the call.
pub async fn serve_connection<S>(
    handle: ControlServiceHandle,
    stream: S,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (outbox_tx, mut outbox_rx) = outbox_channel();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbox_rx.recv().await {
            if let Err(e) = wire::write_frame(&mut write_half, &envelope).await {
                debug!(error = %e, "connection writer finished");
                break;
            }
        }
    });

    let keepalive_outbox = outbox_tx.clone();
    let keepalive = tokio::spawn(keepalive_loop(
        keepalive_outbox,
        handle.keepalive_interval,
    ));

    let source = handle.attach_connection(outbox_tx.clone()).await;
    let result = connection_read_loop(&handle, source, &mut read_half, &outbox_tx).await;

    handle.detach_connection(source).await;
    keepalive.abort();
    writer.abort();
    result
}

/// Probe the peer on a fixed interval, independent of application traffic,
/// to force prompt detection of silently-dropped connections.
async fn keepalive_loop(outbox: mpsc::Sender<Envelope>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    let mut id: u64 = 0;
    loop {
        ticker.tick().await;
        id += 1;
        let envelope = Envelope::Request {
            id,
            command: Command::NoOp.name().to_string(),
            args: Command::NoOp.to_args(),
        };
        if outbox.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn connection_read_loop<R: AsyncRead + Unpin>(
    handle: &ControlServiceHandle,
    source: SourceId,
    reader: &mut R,
    outbox: &mpsc::Sender<Envelope>,
) -> Result<(), ProtocolError> {
    loop {
        let envelope = match wire::read_frame(reader).await {
            Ok(envelope) => envelope,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match envelope {
            Envelope::Request { id, command, args } => {
                match Command::from_wire(&command, &args) {
                    Ok(Command::Version) => {
                        respond(
                            outbox,
                            Envelope::Response {
                                id,
                                result: Reply::Version {
                                    major: PROTOCOL_MAJOR_VERSION,
                                }
                                .to_result(),
                            },
                        )
                        .await?;
                    }
                    Ok(Command::NoOp) => {
                        respond(
                            outbox,
                            Envelope::Response {
                                id,
                                result: Reply::Empty.to_result(),
                            },
                        )
                        .await?;
                    }
                    Ok(Command::NodeState {
                        state_changes,
                        trace_context,
                    }) => {
                        handle.report_state(source, state_changes, trace_context).await;
                        respond(
                            outbox,
                            Envelope::Response {
                                id,
                                result: Reply::Empty.to_result(),
                            },
                        )
                        .await?;
                    }
                    Ok(Command::ClusterStatus { .. }) => {
                        warn!(%source, "agent sent cluster_status to the control service");
                        respond(
                            outbox,
                            Envelope::Error {
                                id,
                                message: "cluster_status flows service to agent".to_string(),
                            },
                        )
                        .await?;
                    }
                    Err(e) => {
                        // Bad arguments poison only this request; the
                        // connection stays up.
                        warn!(%source, error = %e, command = %command, "undecodable command arguments");
                        respond(
                            outbox,
                            Envelope::Error {
                                id,
                                message: e.to_string(),
                            },
                        )
                        .await?;
                    }
                }
            }
            // Replies to our own pushes and probes; nothing to do.
            Envelope::Response { id, .. } => trace!(%source, id, "reply acknowledged"),
            Envelope::Error { id, message } => {
                warn!(%source, id, %message, "agent reported command error")
            }
        }
    }
}

async fn respond(
    outbox: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) -> Result<(), ProtocolError> {
    outbox
        .send(envelope)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Accept agent connections forever, one task per connection.
pub async fn run_server(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handle: ControlServiceHandle,
) -> Result<(), ProtocolError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "incoming agent connection");
        let handle = handle.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(handle, tls_stream).await,
                    Err(e) => Err(ProtocolError::Io(e)),
                },
                None => serve_connection(handle, stream).await,
            };
            match result {
                Ok(()) => info!(%peer, "agent connection closed"),
                Err(e) => warn!(%peer, error = %e, "agent connection failed"),
            }
        });
    }
}
