// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-agent
//!
//! The agent-side runtime. It joins the bus through a transport, loads
//! persisted internal state, and then drives the descriptor loop:
//! selector filtering, slot assembly, lock acquisition, descriptor
//! fetching, user processing with retry-on-failure, and processed /
//! processable bookkeeping. Concrete analyses plug in through
//! [`AgentBehavior`]; the runtime owns everything else.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The behavior seam implemented by concrete agents.
pub mod behavior;
/// Typed bus access for agent code.
pub mod client;

pub use behavior::{AgentBehavior, RunOutcome, SelectorDecision};
pub use client::{AgentError, BusClient, ProcessContext};

use rebus_core::config::{AgentConfig, OperationMode};
use rebus_core::{Descriptor, DescriptorMeta};
use rebus_proto::{RpcRequest, RpcResponse, Signal};
use rebus_transport::{Registration, Transport};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id used for the synthetic context of idle-mode batches.
const IDLE_SENDER: &str = "idle";

/// A descriptor notification buffered by an idle-mode agent.
struct Buffered {
    domain: String,
    uuid: Uuid,
    selector: String,
}

/// The runtime driving one agent.
pub struct AgentRuntime<B: AgentBehavior> {
    behavior: B,
    config: AgentConfig,
    bus: BusClient,
    signals: mpsc::UnboundedReceiver<Signal>,
    /// Lock identity: agent name + output-config signature, so instances
    /// with identical output-altering configuration serialize on each
    /// selector while differently-configured ones run independently.
    lock_id: String,
    slot_roles: Vec<String>,
    /// Per-sample role → selector assembly for slotted agents.
    slot_map: HashMap<Uuid, BTreeMap<String, String>>,
    idle_buffer: Vec<Buffered>,
    held_locks: Vec<(String, String)>,
}

impl<B: AgentBehavior> AgentRuntime<B> {
    /// Join the bus, restore internal state, and run `init`.
    pub async fn start(
        transport: &dyn Transport,
        mut behavior: B,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let registration = Registration::new(
            config.name.clone(),
            config.domain.clone(),
            config.full_signature(),
        );
        let channel = transport.join(registration).await?;
        info!(
            "agent {} registered with id {} in mode {}",
            config.name,
            channel.agent_id(),
            config.mode
        );
        let clock = std::sync::Arc::new(std::sync::Mutex::new(None));
        let bus = BusClient::new(
            channel.rpc,
            config.name.clone(),
            config.domain.clone(),
            clock,
        );

        // Restore state persisted by a previous instance, if any.
        let state = bus
            .rpc()
            .call(RpcRequest::LoadInternalState {
                agent_id: bus.agent_id().to_owned(),
            })
            .await?;
        if let RpcResponse::State(bytes) = state {
            if !bytes.is_empty() {
                behavior.set_internal_state(&bytes);
            }
        }

        behavior.init(&bus).await.map_err(AgentError::Behavior)?;

        let lock_id = format!("{}{}", config.name, config.output_signature());
        let slot_roles = behavior.slots();
        Ok(AgentRuntime {
            behavior,
            config,
            bus,
            signals: channel.signals,
            lock_id,
            slot_roles,
            slot_map: HashMap::new(),
            idle_buffer: Vec::new(),
            held_locks: Vec::new(),
        })
    }

    /// The bus client (for tests and one-shot tools).
    #[must_use]
    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    /// Run until `bus_exit` (or until a custom `run` completes).
    pub async fn run(mut self) -> Result<(), AgentError> {
        match self.behavior.run(&self.bus).await {
            Err(err) => {
                warn!("[{}] run failed: {err:#}", self.bus.agent_id());
                self.finish(false).await?;
                return Err(AgentError::Behavior(err));
            }
            Ok(RunOutcome::Done) => {
                // One-shot tool: persist, unregister, quit.
                self.finish(true).await?;
                return Ok(());
            }
            Ok(RunOutcome::DescriptorLoop) => {}
        }

        while let Some(signal) = self.signals.recv().await {
            match signal {
                Signal::NewDescriptor {
                    sender_id,
                    domain,
                    uuid,
                    selector,
                } => {
                    self.on_descriptor(&sender_id, domain, uuid, selector, None, false)
                        .await?;
                }
                Signal::TargetedDescriptor {
                    sender_id,
                    domain,
                    uuid,
                    selector,
                    targets,
                    user_request,
                } => {
                    if targets.iter().any(|t| t == self.bus.agent_name()) {
                        self.on_descriptor(&sender_id, domain, uuid, selector, user_request, true)
                            .await?;
                    }
                }
                Signal::OnIdle => {
                    if self.config.mode == OperationMode::Idle {
                        self.drain_idle_buffer().await?;
                    }
                    if let Err(err) = self.behavior.on_idle(&self.bus).await {
                        warn!("[{}] on_idle hook failed: {err:#}", self.bus.agent_id());
                    }
                }
                Signal::BusExit { persist_state } => {
                    info!("[{}] bus is exiting", self.bus.agent_id());
                    self.finish(persist_state).await?;
                    return Ok(());
                }
            }
        }
        // Transport gone without bus_exit; nothing left to do.
        Ok(())
    }

    async fn on_descriptor(
        &mut self,
        sender_id: &str,
        domain: String,
        uuid: Uuid,
        selector: String,
        user_request: Option<u64>,
        targeted: bool,
    ) -> Result<(), AgentError> {
        if domain != self.config.domain {
            return Ok(());
        }
        debug!(
            "[{}] received from {sender_id} [{domain}:{selector}]",
            self.bus.agent_id()
        );
        match self.config.mode {
            OperationMode::Automatic => {
                self.consider(sender_id, &domain, uuid, &selector, user_request)
                    .await
            }
            OperationMode::Interactive => {
                if targeted && user_request.is_some() {
                    self.consider(sender_id, &domain, uuid, &selector, user_request)
                        .await
                } else {
                    self.note_processable(&domain, uuid, &selector, false).await
                }
            }
            OperationMode::Idle => self.note_processable(&domain, uuid, &selector, true).await,
        }
    }

    /// Interactive/idle fast path: record interest without processing.
    async fn note_processable(
        &mut self,
        domain: &str,
        uuid: Uuid,
        selector: &str,
        buffer: bool,
    ) -> Result<(), AgentError> {
        match self.behavior.selector_filter(selector) {
            SelectorDecision::Skip => {
                self.mark_processed(domain, selector).await?;
                return Ok(());
            }
            SelectorDecision::Slot(role) => {
                self.slot_map
                    .entry(uuid)
                    .or_default()
                    .insert(role, selector.to_owned());
            }
            SelectorDecision::Accept => {}
        }
        self.mark_processable(domain, selector).await?;
        if buffer {
            self.idle_buffer.push(Buffered {
                domain: domain.to_owned(),
                uuid,
                selector: selector.to_owned(),
            });
        }
        Ok(())
    }

    /// Full processing pipeline for one descriptor notification.
    async fn consider(
        &mut self,
        sender_id: &str,
        domain: &str,
        uuid: Uuid,
        selector: &str,
        user_request: Option<u64>,
    ) -> Result<(), AgentError> {
        // 1. Cheap textual filter.
        let slot_selectors: BTreeMap<String, String> =
            match self.behavior.selector_filter(selector) {
                SelectorDecision::Skip => {
                    // Declining counts as handling, or the bus never idles.
                    self.mark_processed(domain, selector).await?;
                    return Ok(());
                }
                SelectorDecision::Accept => BTreeMap::new(),
                SelectorDecision::Slot(role) => {
                    let filled = self.slot_map.entry(uuid).or_default();
                    filled.insert(role, selector.to_owned());
                    if !self.behavior.slots_ready(filled) {
                        return Ok(());
                    }
                    filled.clone()
                }
            };

        // 2. Lock the selector (or the whole slot set) under this agent's
        // configuration identity.
        let lock_selector = if slot_selectors.is_empty() {
            selector.to_owned()
        } else {
            self.slot_lock_string(&slot_selectors)
        };
        if !self.lock(domain, &lock_selector).await? {
            debug!(
                "[{}] lock busy for {domain}:{lock_selector}",
                self.bus.agent_id()
            );
            return Ok(());
        }
        self.held_locks
            .push((domain.to_owned(), lock_selector.clone()));

        // 3. Fetch the full descriptor.
        let Some(descriptor) = self.bus.get_full(domain, selector).await? else {
            warn!(
                "[{}] descriptor vanished: {domain}:{selector}",
                self.bus.agent_id()
            );
            self.release(domain, &lock_selector, false).await?;
            return Ok(());
        };

        // 4. Fetch slot descriptors. The primary fills its own role.
        let mut slots: BTreeMap<String, Descriptor> = BTreeMap::new();
        for (role, slot_selector) in &slot_selectors {
            if slot_selector == selector {
                slots.insert(role.clone(), descriptor.clone());
                continue;
            }
            let Some(slot_desc) = self.bus.get_full(domain, slot_selector).await? else {
                warn!(
                    "[{}] slot descriptor vanished: {domain}:{slot_selector}",
                    self.bus.agent_id()
                );
                self.release(domain, &lock_selector, false).await?;
                return Ok(());
            };
            slots.insert(role.clone(), slot_desc);
        }

        // 5. Semantic filter.
        let slot_metas: BTreeMap<String, DescriptorMeta> = slots
            .iter()
            .map(|(role, d)| (role.clone(), d.meta().clone()))
            .collect();
        if !self.behavior.descriptor_filter(descriptor.meta(), &slot_metas) {
            self.mark_set_processed(domain, selector, &slot_selectors)
                .await?;
            self.release(domain, &lock_selector, false).await?;
            return Ok(());
        }

        // 6. User processing; failures are logged and scheduled for retry,
        // never propagated.
        info!("[{}] START processing {descriptor}", self.bus.agent_id());
        self.set_clock(Some(Instant::now()));
        let outcome = {
            let ctx = ProcessContext {
                bus: &self.bus,
                sender_id,
                user_request,
            };
            self.behavior.process(&ctx, &descriptor, &slots).await
        };
        self.set_clock(None);
        match outcome {
            Ok(()) => {
                info!("[{}] END processing {descriptor}", self.bus.agent_id());
                self.mark_set_processed(domain, selector, &slot_selectors)
                    .await?;
                if !slot_selectors.is_empty() {
                    self.slot_map.remove(&uuid);
                }
            }
            Err(err) => {
                warn!(
                    "[{}] processing {domain}:{selector} failed: {err:#}",
                    self.bus.agent_id()
                );
                self.release_failed(domain, &lock_selector).await?;
            }
        }
        Ok(())
    }

    /// Drain the idle-mode buffer through `bulk_process`.
    async fn drain_idle_buffer(&mut self) -> Result<(), AgentError> {
        if self.idle_buffer.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.idle_buffer);
        let mut batch: Vec<(Buffered, Descriptor, String)> = Vec::new();
        for entry in buffered {
            debug!(
                "[{}] draining {}:{} (sample {})",
                self.bus.agent_id(),
                entry.domain,
                entry.selector,
                entry.uuid
            );
            if !self.lock(&entry.domain, &entry.selector).await? {
                continue;
            }
            self.held_locks
                .push((entry.domain.clone(), entry.selector.clone()));
            let Some(descriptor) = self.bus.get_full(&entry.domain, &entry.selector).await? else {
                let (domain, selector) = (entry.domain.clone(), entry.selector.clone());
                self.release(&domain, &selector, false).await?;
                continue;
            };
            if !self
                .behavior
                .descriptor_filter(descriptor.meta(), &BTreeMap::new())
            {
                self.mark_processed(&entry.domain, &entry.selector).await?;
                let (domain, selector) = (entry.domain.clone(), entry.selector.clone());
                self.release(&domain, &selector, false).await?;
                continue;
            }
            let lock_selector = entry.selector.clone();
            batch.push((entry, descriptor, lock_selector));
        }
        if batch.is_empty() {
            return Ok(());
        }

        info!(
            "[{}] bulk processing {} buffered descriptors",
            self.bus.agent_id(),
            batch.len()
        );
        self.set_clock(Some(Instant::now()));
        let outcome = {
            let ctx = ProcessContext {
                bus: &self.bus,
                sender_id: IDLE_SENDER,
                user_request: None,
            };
            let descriptors: Vec<Descriptor> =
                batch.iter().map(|(_, d, _)| d.clone()).collect();
            self.behavior.bulk_process(&ctx, &descriptors).await
        };
        self.set_clock(None);
        match outcome {
            Ok(()) => {
                for (entry, _, _) in &batch {
                    self.mark_processed(&entry.domain, &entry.selector).await?;
                }
            }
            Err(err) => {
                warn!("[{}] bulk processing failed: {err:#}", self.bus.agent_id());
                for (entry, _, lock_selector) in &batch {
                    self.release_failed(&entry.domain, lock_selector).await?;
                }
            }
        }
        Ok(())
    }

    /// Persist state (when the store supports it), release held locks,
    /// and unregister.
    async fn finish(&mut self, persist_state: bool) -> Result<(), AgentError> {
        if persist_state {
            if let Some(state) = self.behavior.internal_state() {
                let _ = self
                    .bus
                    .rpc()
                    .call(RpcRequest::StoreInternalState {
                        agent_id: self.bus.agent_id().to_owned(),
                        state,
                    })
                    .await;
            }
        }
        let held = std::mem::take(&mut self.held_locks);
        for (domain, lock_selector) in held {
            let _ = self
                .bus
                .rpc()
                .call(RpcRequest::Unlock {
                    agent_id: self.bus.agent_id().to_owned(),
                    lock_id: self.lock_id.clone(),
                    domain,
                    selector: lock_selector,
                    failed: false,
                    retries: 0,
                    wait_time_secs: 0.0,
                })
                .await;
        }
        debug!("[{}] unregistering", self.bus.agent_id());
        let _ = self
            .bus
            .rpc()
            .call(RpcRequest::Unregister {
                agent_id: self.bus.agent_id().to_owned(),
            })
            .await;
        self.bus.rpc().detach();
        Ok(())
    }

    // -- small helpers -------------------------------------------------------

    /// Slot lock string: selectors joined with `!` in declared role
    /// order, empty for unfilled optional roles, so two instances never
    /// split one sample's slot set.
    fn slot_lock_string(&self, filled: &BTreeMap<String, String>) -> String {
        self.slot_roles
            .iter()
            .map(|role| filled.get(role).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("!")
    }

    fn set_clock(&self, value: Option<Instant>) {
        *self.bus.clock().lock().expect("clock lock poisoned") = value;
    }

    async fn lock(&self, domain: &str, lock_selector: &str) -> Result<bool, AgentError> {
        let response = self
            .bus
            .rpc()
            .call(RpcRequest::Lock {
                agent_id: self.bus.agent_id().to_owned(),
                lock_id: self.lock_id.clone(),
                domain: domain.to_owned(),
                selector: lock_selector.to_owned(),
            })
            .await?;
        Ok(response.as_bool())
    }

    async fn release(
        &mut self,
        domain: &str,
        lock_selector: &str,
        failed: bool,
    ) -> Result<(), AgentError> {
        self.held_locks
            .retain(|(d, s)| !(d == domain && s == lock_selector));
        self.bus
            .rpc()
            .call(RpcRequest::Unlock {
                agent_id: self.bus.agent_id().to_owned(),
                lock_id: self.lock_id.clone(),
                domain: domain.to_owned(),
                selector: lock_selector.to_owned(),
                failed,
                retries: self.config.retries,
                wait_time_secs: self.config.retry_wait_secs,
            })
            .await?;
        Ok(())
    }

    async fn release_failed(&mut self, domain: &str, lock_selector: &str) -> Result<(), AgentError> {
        self.release(domain, lock_selector, true).await
    }

    async fn mark_processed(&self, domain: &str, selector: &str) -> Result<(), AgentError> {
        self.bus
            .rpc()
            .call(RpcRequest::MarkProcessed {
                agent_id: self.bus.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// Mark the primary selector and every slot selector processed.
    async fn mark_set_processed(
        &self,
        domain: &str,
        selector: &str,
        slot_selectors: &BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        self.mark_processed(domain, selector).await?;
        for slot_selector in slot_selectors.values() {
            if slot_selector != selector {
                self.mark_processed(domain, slot_selector).await?;
            }
        }
        Ok(())
    }

    async fn mark_processable(&self, domain: &str, selector: &str) -> Result<(), AgentError> {
        self.bus
            .rpc()
            .call(RpcRequest::MarkProcessable {
                agent_id: self.bus.agent_id().to_owned(),
                domain: domain.to_owned(),
                selector: selector.to_owned(),
            })
            .await?;
        Ok(())
    }
}
