// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed bus access for agent code.
//!
//! [`BusClient`] wraps the transport's RPC handle with descriptor-aware
//! helpers; it is cheap to clone and safe to use from inside `process`.
//! Pushes are stamped with the producer's processing time from the clock
//! the runtime starts when `process` begins.

use rebus_core::{Descriptor, DescriptorMeta, Value};
use rebus_proto::{RpcRequest, RpcResponse};
use rebus_transport::{RpcHandle, TransportError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Agent-side failure.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Descriptor construction failed.
    #[error(transparent)]
    Descriptor(#[from] rebus_core::DescriptorError),

    /// The master rejected the call.
    #[error("rejected by master: {0}")]
    Rejected(String),

    /// The master answered with a response shape the call cannot use.
    #[error("unexpected response to {op}")]
    Unexpected {
        /// Operation that was called.
        op: &'static str,
    },

    /// `init` or `run` of the behavior failed; processing errors are
    /// retried instead of surfacing here.
    #[error("agent behavior failed")]
    Behavior(#[source] anyhow::Error),
}

/// Shared handle on the per-processing-run start clock.
pub(crate) type StartClock = Arc<Mutex<Option<Instant>>>;

/// Cloneable, typed view of the bus for one agent.
#[derive(Clone)]
pub struct BusClient {
    rpc: RpcHandle,
    name: String,
    domain: String,
    clock: StartClock,
}

/// Context handed to `process`/`bulk_process`.
pub struct ProcessContext<'a> {
    /// Bus access.
    pub bus: &'a BusClient,
    /// Agent id that triggered this processing (or `storage`).
    pub sender_id: &'a str,
    /// User request id when this is an interactive on-demand run.
    pub user_request: Option<u64>,
}

impl BusClient {
    pub(crate) fn new(rpc: RpcHandle, name: String, domain: String, clock: StartClock) -> Self {
        BusClient {
            rpc,
            name,
            domain,
            clock,
        }
    }

    /// The unique agent id granted at join time.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        self.rpc.agent_id()
    }

    /// The logical agent name.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.name
    }

    /// The domain this agent subscribed to.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AgentError> {
        match self.rpc.call(request).await? {
            RpcResponse::Error(message) => Err(AgentError::Rejected(message)),
            response => Ok(response),
        }
    }

    /// Publish a descriptor. Returns `false` when the store already had
    /// it.
    pub async fn push(&self, mut descriptor: Descriptor) -> Result<bool, AgentError> {
        if let Some(start) = *self.clock.lock().expect("clock lock poisoned") {
            descriptor
                .meta_mut()
                .set_processing_time(start.elapsed().as_secs_f64());
        }
        let descriptor_display = format!("{descriptor}");
        let outcome = self
            .call(RpcRequest::Push {
                agent_id: self.agent_id().to_owned(),
                descriptor: Box::new(descriptor),
            })
            .await;
        match outcome {
            Ok(RpcResponse::Bool(accepted)) => {
                info!("[{}] pushed {descriptor_display}", self.agent_id());
                Ok(accepted)
            }
            Ok(_) => Err(AgentError::Unexpected { op: "push" }),
            // A payload over the transport's frame cap is refused, not
            // fatal.
            Err(AgentError::Transport(TransportError::Wire(
                err @ rebus_proto::WireError::FrameTooLarge { .. },
            ))) => {
                warn!("[{}] push refused: {err}", self.agent_id());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch descriptor metadata.
    pub async fn get(
        &self,
        domain: &str,
        selector: &str,
    ) -> Result<Option<DescriptorMeta>, AgentError> {
        let response = self
            .call(RpcRequest::Get {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::Descriptor(meta) => Ok(meta),
            _ => Err(AgentError::Unexpected { op: "get" }),
        }
    }

    /// Fetch a descriptor's payload.
    pub async fn get_value(
        &self,
        domain: &str,
        selector: &str,
    ) -> Result<Option<Value>, AgentError> {
        let response = self
            .call(RpcRequest::GetValue {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::Value(value) => Ok(value),
            _ => Err(AgentError::Unexpected { op: "get_value" }),
        }
    }

    /// Fetch metadata and payload together.
    pub async fn get_full(
        &self,
        domain: &str,
        selector: &str,
    ) -> Result<Option<Descriptor>, AgentError> {
        let Some(meta) = self.get(domain, selector).await? else {
            return Ok(None);
        };
        let Some(value) = self.get_value(domain, selector).await? else {
            return Ok(None);
        };
        Ok(Some(Descriptor::from_parts(meta, value)))
    }

    /// Search selectors by regex, most recent first.
    pub async fn find(
        &self,
        domain: &str,
        selector_regex: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, AgentError> {
        let response = self
            .call(RpcRequest::Find {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector_regex: selector_regex.to_owned(),
                limit,
                offset,
            })
            .await?;
        match response {
            RpcResponse::Selectors(selectors) => Ok(selectors),
            _ => Err(AgentError::Unexpected { op: "find" }),
        }
    }

    /// Descriptors whose selector starts with `prefix`.
    pub async fn find_by_selector(
        &self,
        domain: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DescriptorMeta>, AgentError> {
        let response = self
            .call(RpcRequest::FindBySelector {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                prefix: prefix.to_owned(),
                limit,
                offset,
            })
            .await?;
        match response {
            RpcResponse::Descriptors(metas) => Ok(metas),
            _ => Err(AgentError::Unexpected { op: "find_by_selector" }),
        }
    }

    /// Every descriptor of a sample.
    pub async fn find_by_uuid(
        &self,
        domain: &str,
        uuid: Uuid,
    ) -> Result<Vec<DescriptorMeta>, AgentError> {
        let response = self
            .call(RpcRequest::FindByUuid {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                uuid,
            })
            .await?;
        match response {
            RpcResponse::Descriptors(metas) => Ok(metas),
            _ => Err(AgentError::Unexpected { op: "find_by_uuid" }),
        }
    }

    /// Regex search of payloads under a prefix.
    pub async fn find_by_value(
        &self,
        domain: &str,
        prefix: &str,
        value_regex: &str,
    ) -> Result<Vec<DescriptorMeta>, AgentError> {
        let response = self
            .call(RpcRequest::FindByValue {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                prefix: prefix.to_owned(),
                value_regex: value_regex.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::Descriptors(metas) => Ok(metas),
            _ => Err(AgentError::Unexpected { op: "find_by_value" }),
        }
    }

    /// Known sample uuids and labels.
    pub async fn list_uuids(&self, domain: &str) -> Result<BTreeMap<Uuid, String>, AgentError> {
        let response = self
            .call(RpcRequest::ListUuids {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::Uuids(map) => Ok(map),
            _ => Err(AgentError::Unexpected { op: "list_uuids" }),
        }
    }

    /// Children of a descriptor.
    pub async fn get_children(
        &self,
        domain: &str,
        selector: &str,
        recurse: bool,
    ) -> Result<Vec<DescriptorMeta>, AgentError> {
        let response = self
            .call(RpcRequest::GetChildren {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
                recurse,
            })
            .await?;
        match response {
            RpcResponse::Descriptors(metas) => Ok(metas),
            _ => Err(AgentError::Unexpected { op: "get_children" }),
        }
    }

    /// Registered agent names and instance counts.
    pub async fn list_agents(&self) -> Result<BTreeMap<String, u32>, AgentError> {
        let response = self
            .call(RpcRequest::ListAgents {
                agent_id: self.agent_id().to_owned(),
            })
            .await?;
        match response {
            RpcResponse::AgentCounts(counts) => Ok(counts),
            _ => Err(AgentError::Unexpected { op: "list_agents" }),
        }
    }

    /// Per-agent processed counts and the domain total.
    pub async fn processed_stats(
        &self,
        domain: &str,
    ) -> Result<(Vec<(String, u64)>, u64), AgentError> {
        let response = self
            .call(RpcRequest::ProcessedStats {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::Stats { per_agent, total } => Ok((per_agent, total)),
            _ => Err(AgentError::Unexpected { op: "processed_stats" }),
        }
    }

    /// Pairs able to process a selector on request.
    pub async fn get_processable(
        &self,
        domain: &str,
        selector: &str,
    ) -> Result<Vec<(String, String)>, AgentError> {
        let response = self
            .call(RpcRequest::GetProcessable {
                agent_id: self.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
            })
            .await?;
        match response {
            RpcResponse::NameConfigs(pairs) => Ok(pairs),
            _ => Err(AgentError::Unexpected { op: "get_processable" }),
        }
    }

    /// Ask the master to re-emit a descriptor to the named agents.
    pub async fn request_processing(
        &self,
        domain: &str,
        selector: &str,
        targets: Vec<String>,
    ) -> Result<(), AgentError> {
        self.call(RpcRequest::RequestProcessing {
            agent_id: self.agent_id().to_owned(),
            domain: domain.to_owned(),
            selector: selector.to_owned(),
            targets,
        })
        .await?;
        Ok(())
    }

    /// Build and publish both sides of a link between two samples.
    pub async fn declare_link(
        &self,
        a: &DescriptorMeta,
        b: &DescriptorMeta,
        link_type: &str,
        reason: &str,
        symmetric: bool,
    ) -> Result<(), AgentError> {
        let (link_a, link_b) = a.create_links(b, &self.name, link_type, reason, symmetric)?;
        self.push(link_a).await?;
        self.push(link_b).await?;
        Ok(())
    }

    /// Sleep without stalling signal handling elsewhere in the runtime.
    pub async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0))).await;
    }

    pub(crate) fn rpc(&self) -> &RpcHandle {
        &self.rpc
    }

    pub(crate) fn clock(&self) -> &StartClock {
        &self.clock
    }
}
