// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-master
//!
//! The single logical authority of a REbus deployment. The master owns
//! storage, dispenses agent ids, enforces per-configuration locks, routes
//! new and replayed descriptors, keeps per-agent processing counters,
//! detects cluster-wide idleness, and drives graceful shutdown.
//!
//! All coordinator state lives on one task; transports talk to it through
//! a [`MasterHandle`] whose commands carry `oneshot` reply channels. Fan-
//! out signals leave through per-subscriber unbounded channels, which
//! preserves per-subscriber ordering without coupling subscribers to each
//! other.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod coordinator;
/// Delayed re-injection scheduler.
pub mod sched;

pub use coordinator::MasterConfig;

use rebus_proto::{RpcRequest, RpcResponse, Signal};
use rebus_storage::Storage;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Command consumed by the master loop.
#[derive(Debug)]
pub enum MasterCommand {
    /// A unary RPC with its reply channel.
    Rpc {
        /// The request.
        request: RpcRequest,
        /// Where the response goes.
        reply: oneshot::Sender<RpcResponse>,
    },
    /// Consume one agent-id token from the pre-published pool.
    AllocateId {
        /// Receives the token.
        reply: oneshot::Sender<u64>,
    },
    /// Attach a signal subscriber under a transport-chosen key.
    Subscribe {
        /// Subscriber key (agent id or connection id).
        key: String,
        /// Channel the master fans signals into.
        sender: mpsc::UnboundedSender<Signal>,
    },
    /// Detach a signal subscriber.
    Unsubscribe {
        /// Key used at subscription.
        key: String,
    },
    /// Begin (or force) shutdown.
    Shutdown {
        /// `false`: broadcast `bus_exit` and wait for agents to
        /// unregister. `true`: stop the loop now.
        force: bool,
    },
}

/// Cloneable handle to a running master.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterCommand>,
}

impl MasterHandle {
    /// Issue a unary RPC and wait for its response.
    ///
    /// A master that has already stopped yields an error response rather
    /// than a panic, so late callers see a clean failure.
    pub async fn call(&self, request: RpcRequest) -> RpcResponse {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MasterCommand::Rpc { request, reply })
            .is_err()
        {
            return RpcResponse::Error("master is not running".into());
        }
        rx.await
            .unwrap_or_else(|_| RpcResponse::Error("master dropped the call".into()))
    }

    /// Consume one agent-id token.
    pub async fn allocate_id(&self) -> Option<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(MasterCommand::AllocateId { reply }).ok()?;
        rx.await.ok()
    }

    /// Attach a signal subscriber.
    pub fn subscribe(&self, key: impl Into<String>, sender: mpsc::UnboundedSender<Signal>) {
        if self
            .tx
            .send(MasterCommand::Subscribe {
                key: key.into(),
                sender,
            })
            .is_err()
        {
            warn!("subscribe after master stopped");
        }
    }

    /// Detach a signal subscriber.
    pub fn unsubscribe(&self, key: impl Into<String>) {
        let _ = self.tx.send(MasterCommand::Unsubscribe { key: key.into() });
    }

    /// Request shutdown. The first graceful request broadcasts
    /// `bus_exit`; a forced one stops the loop immediately.
    pub fn shutdown(&self, force: bool) {
        let _ = self.tx.send(MasterCommand::Shutdown { force });
    }

    /// Whether the master loop is still accepting commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawn a master over `storage` with default configuration.
pub fn spawn(storage: Box<dyn Storage>) -> (MasterHandle, tokio::task::JoinHandle<()>) {
    spawn_with(storage, MasterConfig::default())
}

/// Spawn a master with explicit configuration.
pub fn spawn_with(
    storage: Box<dyn Storage>,
    config: MasterConfig,
) -> (MasterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let master = coordinator::Master::new(storage, config);
    let join = tokio::spawn(master.run(rx));
    (MasterHandle { tx }, join)
}
