// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker server: the socket face of the master.
//!
//! One listener accepts agent connections. Each connection gets an id
//! grant on attach (consuming a token from the master's pre-published
//! pool), then exchanges frames: RPCs ride one of two priority lanes into
//! a single dispatcher that forwards them to the master one at a time
//! (high before low, prefetch 1, so registrations and metadata calls are
//! never starved by a flood of pushes); signals fan out to every live
//! connection.

use crate::TransportError;
use rebus_master::MasterHandle;
use rebus_proto::frame::{MAX_FRAME_LEN, recv_msg, send_msg};
use rebus_proto::{ClientFrame, Priority, RpcRequest, RpcResponse, ServerFrame, Signal, Wire};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One queued RPC awaiting dispatch to the master.
type QueuedRpc = (RpcRequest, oneshot::Sender<RpcResponse>);

/// TCP broker embedded in the master process.
pub struct BrokerServer {
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl BrokerServer {
    /// Bind the listener and start accepting agents.
    pub async fn bind(addr: &str, master: MasterHandle) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("broker listening on {local_addr}");

        let (high_tx, high_rx) = mpsc::unbounded_channel::<QueuedRpc>();
        let (low_tx, low_rx) = mpsc::unbounded_channel::<QueuedRpc>();
        let dispatch_task = tokio::spawn(dispatch_loop(master.clone(), high_rx, low_rx));

        let accept_task = {
            let master = master.clone();
            tokio::spawn(async move {
                // Connections live in a JoinSet so dropping the broker
                // tears them down with the accept loop.
                let mut connections = tokio::task::JoinSet::new();
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!("agent connection from {peer}");
                                let conn = Connection {
                                    master: master.clone(),
                                    high_tx: high_tx.clone(),
                                    low_tx: low_tx.clone(),
                                };
                                connections.spawn(async move {
                                    if let Err(err) = conn.serve(stream).await {
                                        debug!("connection from {peer} ended: {err}");
                                    }
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "accept failed");
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        },
                        finished = connections.join_next(), if !connections.is_empty() => {
                            let _ = finished;
                        }
                    }
                }
            })
        };

        Ok(BrokerServer {
            local_addr,
            accept_task,
            dispatch_task,
        })
    }

    /// Address the broker is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.dispatch_task.abort();
    }
}

/// Drain the two RPC lanes into the master, one call at a time.
///
/// `biased` keeps the high lane strictly ahead of the low one whenever
/// both have work queued.
async fn dispatch_loop(
    master: MasterHandle,
    mut high_rx: mpsc::UnboundedReceiver<QueuedRpc>,
    mut low_rx: mpsc::UnboundedReceiver<QueuedRpc>,
) {
    loop {
        let (request, reply) = tokio::select! {
            biased;
            Some(item) = high_rx.recv() => item,
            Some(item) = low_rx.recv() => item,
            else => return,
        };
        let response = master.call(request).await;
        let _ = reply.send(response);
    }
}

struct Connection {
    master: MasterHandle,
    high_tx: mpsc::UnboundedSender<QueuedRpc>,
    low_tx: mpsc::UnboundedSender<QueuedRpc>,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> Result<(), TransportError> {
        let (mut read_half, write_half) = stream.into_split();

        // Writer task: everything leaving this connection funnels through
        // one channel so replies and signals interleave without tearing
        // frames.
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let writer_task = tokio::spawn(write_loop(write_half, out_rx));

        // Handshake decides the subscriber key.
        let first: ClientFrame = recv_msg(&mut read_half, Wire::Bin, MAX_FRAME_LEN).await?;
        let subscriber_key = match first {
            ClientFrame::Attach => {
                let token = self
                    .master
                    .allocate_id()
                    .await
                    .ok_or(TransportError::MasterUnavailable)?;
                let _ = out_tx.send(ServerFrame::IdGrant { token });
                format!("conn-{token}")
            }
            ClientFrame::Reattach { agent_id } => {
                debug!("agent {agent_id} reattached");
                let _ = out_tx.send(ServerFrame::Reattached);
                format!("reconn-{agent_id}")
            }
            ClientFrame::Rpc { .. } => {
                return Err(TransportError::Rejected(
                    "connection must attach before calling".into(),
                ));
            }
        };

        // Fan signals from the master into the writer.
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();
        self.master.subscribe(subscriber_key.clone(), signal_tx);
        let signal_task = {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(signal) = signal_rx.recv().await {
                    if out_tx.send(ServerFrame::Signal(signal)).is_err() {
                        return;
                    }
                }
            })
        };

        let served = self.read_loop(&mut read_half, &out_tx).await;

        self.master.unsubscribe(&subscriber_key);
        signal_task.abort();
        drop(out_tx);
        let _ = writer_task.await;
        served
    }

    async fn read_loop(
        &self,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        out_tx: &mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<(), TransportError> {
        loop {
            let frame: ClientFrame = match recv_msg(read_half, Wire::Bin, MAX_FRAME_LEN).await {
                Ok(frame) => frame,
                Err(rebus_proto::WireError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            match frame {
                ClientFrame::Rpc {
                    correlation,
                    priority,
                    request,
                } => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let lane = match priority {
                        Priority::High => &self.high_tx,
                        Priority::Low => &self.low_tx,
                    };
                    if lane.send((request, reply_tx)).is_err() {
                        return Err(TransportError::MasterUnavailable);
                    }
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let response = reply_rx
                            .await
                            .unwrap_or_else(|_| RpcResponse::Error("master dropped the call".into()));
                        let _ = out_tx.send(ServerFrame::RpcReply {
                            correlation,
                            response,
                        });
                    });
                }
                ClientFrame::Attach | ClientFrame::Reattach { .. } => {
                    return Err(TransportError::Rejected("duplicate attach".into()));
                }
            }
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<ServerFrame>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = send_msg(&mut write_half, Wire::Bin, &frame, MAX_FRAME_LEN).await {
            debug!("write to agent failed: {err}");
            return;
        }
    }
}
