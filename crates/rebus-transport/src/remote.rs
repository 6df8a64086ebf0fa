// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker client: how an agent process reaches a remote master.
//!
//! A connection actor owns the socket. Calls enter through a command
//! channel, are written as correlated frames, and complete when the
//! matching reply arrives. On disconnect the actor reconnects with a
//! fixed backoff, re-attaches under its granted id, and re-sends every
//! in-flight request; signals missed during the outage are gone (the
//! master's replay-on-register path is the recovery mechanism).

use crate::{
    AgentChannel, Registration, RpcClient, RpcHandle, Transport, TransportError, reject_on_error,
};
use async_trait::async_trait;
use rebus_proto::frame::{MAX_FRAME_LEN, recv_msg, send_msg};
use rebus_proto::{ClientFrame, RpcRequest, RpcResponse, ServerFrame, Signal, Wire};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay between reconnection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

type CallReply = oneshot::Sender<Result<RpcResponse, TransportError>>;

enum Command {
    Call(RpcRequest, CallReply),
    Close,
}

/// Transport connecting to a [`BrokerServer`](crate::BrokerServer) over
/// TCP.
#[derive(Clone)]
pub struct BrokerTransport {
    addr: String,
}

impl BrokerTransport {
    /// Transport for the broker at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        BrokerTransport { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn join(&self, registration: Registration) -> Result<AgentChannel, TransportError> {
        // Connect and consume an id grant.
        let mut stream = connect_with_backoff(&self.addr).await;
        send_msg(&mut stream, Wire::Bin, &ClientFrame::Attach, MAX_FRAME_LEN).await?;
        let grant: ServerFrame = recv_msg(&mut stream, Wire::Bin, MAX_FRAME_LEN).await?;
        let ServerFrame::IdGrant { token } = grant else {
            return Err(TransportError::Rejected("expected an id grant".into()));
        };
        let agent_id = format!("{}-{token}", registration.name);
        info!("joined broker at {} as {agent_id}", self.addr);

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor {
            addr: self.addr.clone(),
            agent_id: agent_id.clone(),
            signal_tx,
            pending: HashMap::new(),
        };
        tokio::spawn(actor.run(stream, cmd_rx));

        let rpc = RpcHandle::new(agent_id.clone(), Arc::new(RemoteRpc { cmd_tx }));
        let response = rpc
            .call(RpcRequest::Register {
                agent_id: agent_id.clone(),
                domain: registration.domain,
                path: format!("/agent/{}", registration.name),
                config: registration.config,
            })
            .await?;
        reject_on_error(response)?;
        Ok(AgentChannel { rpc, signals })
    }
}

struct RemoteRpc {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl RpcClient for RemoteRpc {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call(request, reply_tx))
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    fn detach(&self, _agent_id: &str) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// One in-flight request: kept until its reply arrives so it can be
/// retried across a reconnect.
struct Pending {
    request: RpcRequest,
    reply: CallReply,
}

struct ConnectionActor {
    addr: String,
    agent_id: String,
    signal_tx: mpsc::UnboundedSender<Signal>,
    pending: HashMap<Uuid, Pending>,
}

impl ConnectionActor {
    async fn run(mut self, stream: TcpStream, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let (read_half, mut write_half) = stream.into_split();
        let mut frames_rx = spawn_reader(read_half);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Call(request, reply)) => {
                        let correlation = Uuid::new_v4();
                        let frame = ClientFrame::Rpc {
                            correlation,
                            priority: request.priority(),
                            request: request.clone(),
                        };
                        self.pending.insert(correlation, Pending { request, reply });
                        if let Err(err) =
                            send_msg(&mut write_half, Wire::Bin, &frame, MAX_FRAME_LEN).await
                        {
                            debug!("write failed ({err}), reconnecting");
                            let (r, w) = self.reconnect().await;
                            frames_rx = r;
                            write_half = w;
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!("{} closing broker connection", self.agent_id);
                        return;
                    }
                },
                frame = frames_rx.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        debug!("{} lost broker connection, reconnecting", self.agent_id);
                        let (r, w) = self.reconnect().await;
                        frames_rx = r;
                        write_half = w;
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::RpcReply {
                correlation,
                response,
            } => match self.pending.remove(&correlation) {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(response));
                }
                None => warn!("reply with unknown correlation id {correlation}"),
            },
            ServerFrame::Signal(signal) => {
                let _ = self.signal_tx.send(signal);
            }
            ServerFrame::IdGrant { .. } | ServerFrame::Reattached => {
                // Handshake frames outside a handshake; harmless.
            }
        }
    }

    /// Reconnect, re-attach under the granted id, and replay every
    /// in-flight request.
    async fn reconnect(&mut self) -> (mpsc::UnboundedReceiver<ServerFrame>, OwnedWriteHalf) {
        loop {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            let mut stream = connect_with_backoff(&self.addr).await;
            let reattach = ClientFrame::Reattach {
                agent_id: self.agent_id.clone(),
            };
            if send_msg(&mut stream, Wire::Bin, &reattach, MAX_FRAME_LEN)
                .await
                .is_err()
            {
                continue;
            }
            match recv_msg::<_, ServerFrame>(&mut stream, Wire::Bin, MAX_FRAME_LEN).await {
                Ok(ServerFrame::Reattached) => {}
                Ok(_) | Err(_) => continue,
            }
            info!("{} reattached to broker", self.agent_id);
            let (read_half, mut write_half) = stream.into_split();
            let frames_rx = spawn_reader(read_half);

            // Retry everything that was in flight when the link dropped.
            let mut resend_failed = false;
            for (correlation, pending) in &self.pending {
                let frame = ClientFrame::Rpc {
                    correlation: *correlation,
                    priority: pending.request.priority(),
                    request: pending.request.clone(),
                };
                if send_msg(&mut write_half, Wire::Bin, &frame, MAX_FRAME_LEN)
                    .await
                    .is_err()
                {
                    resend_failed = true;
                    break;
                }
            }
            if resend_failed {
                continue;
            }
            return (frames_rx, write_half);
        }
    }
}

/// Reader task: turns the read half into a frame stream. Channel closure
/// signals a dead connection.
fn spawn_reader(mut read_half: OwnedReadHalf) -> mpsc::UnboundedReceiver<ServerFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match recv_msg::<_, ServerFrame>(&mut read_half, Wire::Bin, MAX_FRAME_LEN).await {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!("broker read ended: {err}");
                    return;
                }
            }
        }
    });
    rx
}

/// Connect, retrying forever with a fixed backoff.
async fn connect_with_backoff(addr: &str) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(err) => {
                warn!("cannot connect to broker at {addr}: {err}, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}
