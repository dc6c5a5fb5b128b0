//! Agent Connection
//!
//! The agent side of the control protocol. One reader task demultiplexes the
//! duplex stream: responses are matched to in-flight calls by id, service
//! pushes (`cluster_status`, `noop`, `version`) are answered inline and
//! status payloads handed to the caller through a channel.

use crate::error::ProtocolError;
use crate::model::state::{DeploymentState, StateUpdate};
use crate::model::Deployment;
use crate::protocol::wire::{self, Envelope};
use crate::protocol::{Command, Reply, PROTOCOL_MAJOR_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A snapshot pushed by the control service.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub configuration: Deployment,
    pub state: DeploymentState,
    pub trace_context: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, ProtocolError>>>>>;

/// A live, version-checked connection to the control service.
pub struct AgentConnection {
    outbox: mpsc::Sender<Envelope>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl AgentConnection {
    /// Establish the protocol over an already-connected stream: spawns the
    /// reader, writer and keepalive tasks, then performs the version
    /// handshake. Status pushes arrive on the returned receiver.
    pub async fn connect<S>(
        stream: S,
        keepalive_interval: Duration,
    ) -> Result<(AgentConnection, mpsc::Receiver<ClusterStatus>), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Envelope>(32);
        let (status_tx, status_rx) = mpsc::channel(8);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(0));

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbox_rx.recv().await {
                if let Err(e) = wire::write_frame(&mut write_half, &envelope).await {
                    debug!(error = %e, "agent connection writer finished");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_outbox = outbox_tx.clone();
        let writer_abort = writer.abort_handle();
        let reader = tokio::spawn(async move {
            let result =
                read_loop(&mut read_half, &reader_pending, &reader_outbox, &status_tx).await;
            if let Err(e) = &result {
                debug!(error = %e, "agent connection reader finished");
            }
            // Every in-flight call learns the connection is gone.
            let mut pending = reader_pending.lock().await;
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(ProtocolError::ConnectionClosed));
            }
            // With the reader gone no response can ever arrive, even on a
            // half-closed stream whose writer still succeeds. Stop the writer
            // so every later call sees a closed outbox instead of waiting.
            writer_abort.abort();
        });

        let keepalive_outbox = outbox_tx.clone();
        let keepalive_ids = Arc::clone(&next_id);
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                // Fire-and-forget probe; the unmatched response is ignored
                // by the reader.
                let id = keepalive_ids.fetch_add(1, Ordering::Relaxed) + 1;
                let envelope = Envelope::Request {
                    id,
                    command: Command::NoOp.name().to_string(),
                    args: Command::NoOp.to_args(),
                };
                if keepalive_outbox.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        let connection = AgentConnection {
            outbox: outbox_tx,
            pending,
            next_id,
            writer,
            reader,
            keepalive,
        };
        connection.handshake().await?;
        Ok((connection, status_rx))
    }

    async fn handshake(&self) -> Result<(), ProtocolError> {
        match self.call(Command::Version).await? {
            Reply::Version { major } if major == PROTOCOL_MAJOR_VERSION => Ok(()),
            Reply::Version { major } => Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_MAJOR_VERSION,
                remote: major,
            }),
            Reply::Empty => Err(ProtocolError::MalformedFrame(
                "version command answered with an empty result".to_string(),
            )),
        }
    }

    /// Report partial node state to the control service.
    pub async fn send_state_report(
        &self,
        state_changes: Vec<StateUpdate>,
        trace_context: Option<String>,
    ) -> Result<(), ProtocolError> {
        self.call(Command::NodeState {
            state_changes,
            trace_context,
        })
        .await?;
        Ok(())
    }

    /// Round-trip liveness probe.
    pub async fn noop(&self) -> Result<(), ProtocolError> {
        self.call(Command::NoOp).await?;
        Ok(())
    }

    async fn call(&self, command: Command) -> Result<Reply, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        let envelope = Envelope::Request {
            id,
            command: command.name().to_string(),
            args: command.to_args(),
        };
        if self.outbox.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }
        // The writer shutting down means no response can ever arrive; a call
        // issued after the reader drained the pending map must not hang.
        tokio::select! {
            reply = rx => reply.map_err(|_| ProtocolError::ConnectionClosed)?,
            _ = self.outbox.closed() => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    pending: &Pending,
    outbox: &mpsc::Sender<Envelope>,
    statuses: &mpsc::Sender<ClusterStatus>,
) -> Result<(), ProtocolError> {
    loop {
        match wire::read_frame(reader).await? {
            Envelope::Response { id, result } => {
                match pending.lock().await.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(Reply::from_wire(&result));
                    }
                    // Reply to a fire-and-forget probe.
                    None => trace!(id, "unmatched response"),
                }
            }
            Envelope::Error { id, message } => match pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Err(ProtocolError::CommandFailed(message)));
                }
                None => warn!(id, %message, "unmatched error response"),
            },
            Envelope::Request { id, command, args } => {
                let reply = match Command::from_wire(&command, &args) {
                    Ok(Command::Version) => Ok(Reply::Version {
                        major: PROTOCOL_MAJOR_VERSION,
                    }),
                    Ok(Command::NoOp) => Ok(Reply::Empty),
                    Ok(Command::ClusterStatus {
                        configuration,
                        state,
                        trace_context,
                    }) => {
                        let status = ClusterStatus {
                            configuration,
                            state,
                            trace_context,
                        };
                        // A caller that stops consuming statuses drops the
                        // receiver; pushes are then acknowledged and thrown
                        // away.
                        if statuses.send(status).await.is_err() {
                            trace!("status receiver gone, discarding push");
                        }
                        Ok(Reply::Empty)
                    }
                    Ok(Command::NodeState { .. }) => {
                        warn!("control service sent node_state to an agent");
                        Err("node_state flows agent to service".to_string())
                    }
                    Err(e) => {
                        warn!(error = %e, command = %command, "undecodable command arguments");
                        Err(e.to_string())
                    }
                };
                let envelope = match reply {
                    Ok(reply) => Envelope::Response {
                        id,
                        result: reply.to_result(),
                    },
                    Err(message) => Envelope::Error { id, message },
                };
                if outbox.send(envelope).await.is_err() {
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        }
    }
}
