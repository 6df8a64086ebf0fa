// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-transport
//!
//! Carries typed RPC calls and fan-out signals between the master and its
//! agents. Two verbs, two implementations:
//!
//! - [`LocalTransport`] — everything in one address space; signals are
//!   direct channel sends, no message loss possible.
//! - [`BrokerTransport`] — agents in separate processes, talking to a
//!   [`BrokerServer`] embedded in the master binary over length-prefixed
//!   binary frames. Reconnects with backoff; missed signals are recovered
//!   by the master's replay-on-register path, not the transport.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// TCP broker server half (embedded in the master binary).
pub mod broker;
/// In-process transport.
pub mod local;
/// TCP broker client half (used by agent processes).
pub mod remote;

pub use broker::BrokerServer;
pub use local::LocalTransport;
pub use remote::BrokerTransport;

use async_trait::async_trait;
use rebus_proto::{RpcRequest, RpcResponse, Signal};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The master is not running (or went away mid-call).
    #[error("master is unavailable")]
    MasterUnavailable,

    /// The master rejected the operation.
    #[error("rejected by master: {0}")]
    Rejected(String),

    /// Wire serialization or framing failed.
    #[error(transparent)]
    Wire(#[from] rebus_proto::WireError),

    /// Socket-level failure that reconnection could not absorb.
    #[error("connection failed")]
    Io(#[from] std::io::Error),

    /// The connection actor is gone; no further calls can be made.
    #[error("transport connection closed")]
    Closed,
}

/// What an agent presents when joining the bus.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Logical agent name; instance ids are `<name>-<token>`.
    pub name: String,
    /// Domain the agent subscribes to.
    pub domain: String,
    /// Full configuration string (JSON object).
    pub config: String,
}

impl Registration {
    /// Registration with an empty configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: impl Into<String>, config: String) -> Self {
        Registration {
            name: name.into(),
            domain: domain.into(),
            config,
        }
    }
}

/// Unary-call client half of a transport connection.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Issue one RPC and wait for the response.
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError>;

    /// Tear down transport-side resources for this agent (subscriber
    /// entries, sockets). Called after `unregister`.
    fn detach(&self, agent_id: &str);
}

/// Cloneable handle for issuing RPCs as a particular agent.
#[derive(Clone)]
pub struct RpcHandle {
    agent_id: String,
    client: Arc<dyn RpcClient>,
}

impl RpcHandle {
    /// Wrap a client under an agent identity.
    #[must_use]
    pub fn new(agent_id: String, client: Arc<dyn RpcClient>) -> Self {
        RpcHandle { agent_id, client }
    }

    /// The agent id calls are issued under.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Issue one RPC.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        self.client.call(request).await
    }

    /// Release transport resources after unregistering.
    pub fn detach(&self) {
        self.client.detach(&self.agent_id);
    }
}

/// A joined agent's connection: its RPC handle plus the signal stream.
pub struct AgentChannel {
    /// Handle for unary calls (cloneable, usable from processing code).
    pub rpc: RpcHandle,
    /// Ordered stream of fan-out signals.
    pub signals: mpsc::UnboundedReceiver<Signal>,
}

impl AgentChannel {
    /// The agent id granted at join time.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        self.rpc.agent_id()
    }
}

/// A way onto the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join the bus: consume an id token, subscribe to signals, register.
    async fn join(&self, registration: Registration) -> Result<AgentChannel, TransportError>;
}

/// Map a response to `Err` when the master answered with an error.
pub(crate) fn reject_on_error(response: RpcResponse) -> Result<RpcResponse, TransportError> {
    match response {
        RpcResponse::Error(message) => Err(TransportError::Rejected(message)),
        other => Ok(other),
    }
}
