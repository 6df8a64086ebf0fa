// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-proto
//!
//! Typed messages exchanged between agents and the master: unary RPC
//! requests with their responses, fan-out signals, and the broker frames
//! that carry both over a socket. Serialization goes through a pluggable
//! [`Wire`] format; the TCP broker adds length-prefixed framing on top
//! (see [`frame`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Length-prefixed frame codec for socket transports.
pub mod frame;
/// Pluggable wire serialization formats.
pub mod wire;

use rebus_core::{Descriptor, DescriptorMeta, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use wire::{Wire, WireError};

/// Priority lane an RPC rides on.
///
/// Registrations and metadata operations go high so a flood of pushes
/// cannot starve them; `push` itself goes low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Served before any queued low-priority request.
    High,
    /// Bulk lane for descriptor publication.
    Low,
}

/// Unary RPC from an agent to the master.
///
/// Every variant carries the caller's `agent_id`; responses are
/// synchronous from the caller's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcRequest {
    /// Announce an agent on the bus and trigger replay of missed work.
    Register {
        /// Caller id, `<name>-<sequence>`.
        agent_id: String,
        /// Domain the agent subscribes to.
        domain: String,
        /// Display path of the agent, `/agent/<name>`.
        path: String,
        /// Full configuration string (JSON object, see
        /// [`rebus_core::config`]).
        config: String,
    },
    /// Remove an agent from the bus.
    Unregister {
        /// Caller id.
        agent_id: String,
    },
    /// Try to acquire the processing lock for a selector.
    Lock {
        /// Caller id.
        agent_id: String,
        /// Lock identity: agent name + output-config signature.
        lock_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector (or joined slot set) being locked.
        selector: String,
    },
    /// Release a processing lock, optionally scheduling a retry.
    Unlock {
        /// Caller id.
        agent_id: String,
        /// Lock identity used at acquisition.
        lock_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector being unlocked.
        selector: String,
        /// Whether processing failed (enables retry scheduling).
        failed: bool,
        /// Retry budget for this (agent, selector).
        retries: u32,
        /// Delay before the retry re-injection, in seconds.
        wait_time_secs: f64,
    },
    /// Publish a descriptor.
    Push {
        /// Caller id.
        agent_id: String,
        /// The descriptor, metadata and payload.
        descriptor: Box<Descriptor>,
    },
    /// Fetch descriptor metadata (payload stays behind).
    Get {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector; `~N` version references are resolved.
        selector: String,
    },
    /// Fetch a descriptor's payload.
    GetValue {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector; `~N` version references are resolved.
        selector: String,
    },
    /// Map known sample uuids to labels.
    ListUuids {
        /// Caller id.
        agent_id: String,
        /// Domain to enumerate.
        domain: String,
    },
    /// Search selectors by regex, most recent first.
    Find {
        /// Caller id.
        agent_id: String,
        /// Domain to search.
        domain: String,
        /// Regex applied to selectors.
        selector_regex: String,
        /// Maximum results; `0` = unlimited.
        limit: usize,
        /// Results to skip.
        offset: usize,
    },
    /// Fetch descriptors whose selector starts with a prefix.
    FindBySelector {
        /// Caller id.
        agent_id: String,
        /// Domain to search.
        domain: String,
        /// Selector prefix.
        prefix: String,
        /// Maximum results; `0` = unlimited.
        limit: usize,
        /// Results to skip.
        offset: usize,
    },
    /// Fetch all descriptors of a sample.
    FindByUuid {
        /// Caller id.
        agent_id: String,
        /// Domain to search.
        domain: String,
        /// Sample uuid.
        uuid: Uuid,
    },
    /// Regex-search payloads under a selector prefix (full scan).
    FindByValue {
        /// Caller id.
        agent_id: String,
        /// Domain to search.
        domain: String,
        /// Selector prefix bounding the scan.
        prefix: String,
        /// Regex applied to the payload's textual form.
        value_regex: String,
    },
    /// Record that the caller finished (or declined) a selector.
    MarkProcessed {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector processed.
        selector: String,
    },
    /// Record that the caller, in interactive mode, could process a
    /// selector.
    MarkProcessable {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector marked.
        selector: String,
    },
    /// List (agent name, output-config) pairs able to process a selector.
    GetProcessable {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector queried.
        selector: String,
    },
    /// Map registered agent names to instance counts.
    ListAgents {
        /// Caller id.
        agent_id: String,
    },
    /// Per-agent processed counts plus the domain total.
    ProcessedStats {
        /// Caller id.
        agent_id: String,
        /// Domain to report on.
        domain: String,
    },
    /// Fetch descriptors derived from a selector.
    GetChildren {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Parent selector.
        selector: String,
        /// Whether to include transitive children.
        recurse: bool,
    },
    /// Persist the caller's opaque internal state.
    StoreInternalState {
        /// Caller id.
        agent_id: String,
        /// Serialized state.
        state: Vec<u8>,
    },
    /// Load the caller's persisted internal state.
    LoadInternalState {
        /// Caller id.
        agent_id: String,
    },
    /// Ask the master to re-emit a descriptor to named agents.
    RequestProcessing {
        /// Caller id.
        agent_id: String,
        /// Descriptor domain.
        domain: String,
        /// Selector to re-emit.
        selector: String,
        /// Agent names addressed.
        targets: Vec<String>,
    },
}

impl RpcRequest {
    /// Which priority lane this request rides on the broker transport.
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            RpcRequest::Push { .. } => Priority::Low,
            _ => Priority::High,
        }
    }

    /// Short operation name for logging.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            RpcRequest::Register { .. } => "REGISTER",
            RpcRequest::Unregister { .. } => "UNREGISTER",
            RpcRequest::Lock { .. } => "LOCK",
            RpcRequest::Unlock { .. } => "UNLOCK",
            RpcRequest::Push { .. } => "PUSH",
            RpcRequest::Get { .. } => "GET",
            RpcRequest::GetValue { .. } => "GETVALUE",
            RpcRequest::ListUuids { .. } => "LISTUUIDS",
            RpcRequest::Find { .. } => "FIND",
            RpcRequest::FindBySelector { .. } => "FINDBYSELECTOR",
            RpcRequest::FindByUuid { .. } => "FINDBYUUID",
            RpcRequest::FindByValue { .. } => "FINDBYVALUE",
            RpcRequest::MarkProcessed { .. } => "MARK_PROCESSED",
            RpcRequest::MarkProcessable { .. } => "MARK_PROCESSABLE",
            RpcRequest::GetProcessable { .. } => "GET_PROCESSABLE",
            RpcRequest::ListAgents { .. } => "LIST_AGENTS",
            RpcRequest::ProcessedStats { .. } => "PROCESSED_STATS",
            RpcRequest::GetChildren { .. } => "GET_CHILDREN",
            RpcRequest::StoreInternalState { .. } => "STORE_INTSTATE",
            RpcRequest::LoadInternalState { .. } => "LOAD_INTSTATE",
            RpcRequest::RequestProcessing { .. } => "REQUEST_PROCESSING",
        }
    }
}

/// Response to an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    /// Operation completed; nothing to return.
    Unit,
    /// Boolean outcome (`lock`, `push`, `mark_*`).
    Bool(bool),
    /// Descriptor metadata, or `None` for unknown selectors.
    Descriptor(Option<DescriptorMeta>),
    /// Descriptor payload, or `None` for unknown selectors.
    Value(Option<Value>),
    /// Selector list, most recent first.
    Selectors(Vec<String>),
    /// Descriptor metadata list.
    Descriptors(Vec<DescriptorMeta>),
    /// Sample uuid → label.
    Uuids(BTreeMap<Uuid, String>),
    /// (agent name, output-config signature) pairs.
    NameConfigs(Vec<(String, String)>),
    /// Agent name → number of registered instances.
    AgentCounts(BTreeMap<String, u32>),
    /// Per-agent processed counts plus the domain's selector total.
    Stats {
        /// (agent name, distinct processed selectors).
        per_agent: Vec<(String, u64)>,
        /// Total selectors stored in the domain.
        total: u64,
    },
    /// Persisted internal state (empty if none).
    State(Vec<u8>),
    /// The master rejected or failed the call.
    Error(String),
}

impl RpcResponse {
    /// Unwrap a boolean response, treating anything else as `false`.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        matches!(self, RpcResponse::Bool(true))
    }
}

/// Fan-out notification from the master to every agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// A new descriptor entered the store.
    NewDescriptor {
        /// Agent id that pushed it (or `storage` for replays).
        sender_id: String,
        /// Descriptor domain.
        domain: String,
        /// Sample uuid.
        uuid: Uuid,
        /// Descriptor selector.
        selector: String,
    },
    /// A descriptor addressed to specific agents (replay, retry, user
    /// request).
    TargetedDescriptor {
        /// Originating agent id (or `storage`).
        sender_id: String,
        /// Descriptor domain.
        domain: String,
        /// Sample uuid.
        uuid: Uuid,
        /// Descriptor selector.
        selector: String,
        /// Agent names addressed; others ignore the signal.
        targets: Vec<String>,
        /// User request id for interactive runs; `None` for replay and
        /// retry.
        user_request: Option<u64>,
    },
    /// The bus is shutting down.
    BusExit {
        /// Whether agents should persist internal state before
        /// unregistering.
        persist_state: bool,
    },
    /// Every descriptor is processed or processable by every
    /// uniquely-configured agent.
    OnIdle,
}

// ---------------------------------------------------------------------------
// Broker frames
// ---------------------------------------------------------------------------

/// Frame sent by an agent connection to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame of a fresh connection; the broker answers with an
    /// [`ServerFrame::IdGrant`] consumed from the pre-published pool.
    Attach,
    /// First frame after a reconnect; re-associates the connection with
    /// an already granted id.
    Reattach {
        /// Agent id granted on the original connection.
        agent_id: String,
    },
    /// A unary RPC.
    Rpc {
        /// Correlation id echoed in the reply.
        correlation: Uuid,
        /// Priority lane.
        priority: Priority,
        /// The request.
        request: RpcRequest,
    },
}

/// Frame sent by the broker to an agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    /// Registration id token; the agent id is `<name>-<token>`.
    IdGrant {
        /// Unique, monotonically numbered token.
        token: u64,
    },
    /// Reattach accepted; signals resume on this connection.
    Reattached,
    /// Reply to an [`ClientFrame::Rpc`].
    RpcReply {
        /// Correlation id of the request.
        correlation: Uuid,
        /// The response.
        response: RpcResponse,
    },
    /// A fan-out signal.
    Signal(Signal),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebus_core::DEFAULT_DOMAIN;

    fn sample_request() -> RpcRequest {
        RpcRequest::Push {
            agent_id: "inject-0".into(),
            descriptor: Box::new(
                Descriptor::new(
                    "hi",
                    "/raw",
                    Value::Bytes(b"HELLOWORLD".to_vec()),
                    DEFAULT_DOMAIN,
                    "inject",
                )
                .unwrap(),
            ),
        }
    }

    #[test]
    fn push_rides_the_low_lane() {
        assert_eq!(sample_request().priority(), Priority::Low);
        let reg = RpcRequest::Register {
            agent_id: "a-1".into(),
            domain: DEFAULT_DOMAIN.into(),
            path: "/agent/a".into(),
            config: "{}".into(),
        };
        assert_eq!(reg.priority(), Priority::High);
    }

    #[test]
    fn requests_round_trip_in_both_formats() {
        let req = sample_request();
        for wire in [Wire::Json, Wire::Bin] {
            let bytes = wire.encode(&req).unwrap();
            let back: RpcRequest = wire.decode(&bytes).unwrap();
            match (&req, &back) {
                (
                    RpcRequest::Push { descriptor: a, .. },
                    RpcRequest::Push { descriptor: b, .. },
                ) => assert_eq!(a, b),
                _ => panic!("variant changed in transit"),
            }
        }
    }

    #[test]
    fn signals_round_trip_in_both_formats() {
        let sig = Signal::TargetedDescriptor {
            sender_id: "storage".into(),
            domain: DEFAULT_DOMAIN.into(),
            uuid: Uuid::new_v4(),
            selector: format!("/raw/%{}", "0".repeat(64)),
            targets: vec!["unarchive".into()],
            user_request: Some(7),
        };
        for wire in [Wire::Json, Wire::Bin] {
            let bytes = wire.encode(&sig).unwrap();
            let back: Signal = wire.decode(&bytes).unwrap();
            match back {
                Signal::TargetedDescriptor { user_request, targets, .. } => {
                    assert_eq!(user_request, Some(7));
                    assert_eq!(targets, vec!["unarchive".to_owned()]);
                }
                _ => panic!("variant changed in transit"),
            }
        }
    }
}
