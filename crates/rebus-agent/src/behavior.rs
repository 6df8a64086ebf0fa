// SPDX-License-Identifier: MIT OR Apache-2.0
//! The behavior seam: what a concrete agent supplies.
//!
//! The runtime owns the loop — subscription, filtering, locking, retries,
//! marking — and delegates the analysis itself to an [`AgentBehavior`].
//! Every method has a default, so a minimal agent only implements
//! [`process`].
//!
//! [`process`]: AgentBehavior::process

use crate::client::{BusClient, ProcessContext};
use async_trait::async_trait;
use rebus_core::{Descriptor, DescriptorMeta};
use std::collections::BTreeMap;

/// What the selector filter decided about a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorDecision {
    /// Not interesting; the runtime records a decline.
    Skip,
    /// Process this descriptor on its own.
    Accept,
    /// Register the selector under a named slot; processing starts when
    /// the slot set is ready.
    Slot(String),
}

/// Whether the behavior's `run` replaces the descriptor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Enter the descriptor-driven loop (the default).
    DescriptorLoop,
    /// The agent did its one-shot work (inject, cat, ls); unregister and
    /// quit.
    Done,
}

/// Override points for a concrete agent.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// One-time setup after registration, before any descriptor arrives.
    async fn init(&mut self, bus: &BusClient) -> anyhow::Result<()> {
        let _ = bus;
        Ok(())
    }

    /// Entry point replacing the descriptor loop for one-shot tools.
    ///
    /// The default keeps the loop.
    async fn run(&mut self, bus: &BusClient) -> anyhow::Result<RunOutcome> {
        let _ = bus;
        Ok(RunOutcome::DescriptorLoop)
    }

    /// Cheap textual filter applied before anything else.
    fn selector_filter(&mut self, selector: &str) -> SelectorDecision {
        let _ = selector;
        SelectorDecision::Accept
    }

    /// Semantic filter applied once metadata (and slot metadata) is in
    /// hand.
    fn descriptor_filter(
        &mut self,
        descriptor: &DescriptorMeta,
        slots: &BTreeMap<String, DescriptorMeta>,
    ) -> bool {
        let _ = (descriptor, slots);
        true
    }

    /// Process one descriptor (with its slot descriptors, if any).
    ///
    /// Errors are caught by the runtime, logged, and turned into retry
    /// scheduling; they never take the agent down.
    async fn process(
        &mut self,
        ctx: &ProcessContext<'_>,
        descriptor: &Descriptor,
        slots: &BTreeMap<String, Descriptor>,
    ) -> anyhow::Result<()>;

    /// Process a batch buffered in idle mode.
    ///
    /// The default feeds each descriptor through [`process`].
    ///
    /// [`process`]: AgentBehavior::process
    async fn bulk_process(
        &mut self,
        ctx: &ProcessContext<'_>,
        batch: &[Descriptor],
    ) -> anyhow::Result<()> {
        let empty = BTreeMap::new();
        for descriptor in batch {
            self.process(ctx, descriptor, &empty).await?;
        }
        Ok(())
    }

    /// Named slot roles this agent assembles per sample; empty for
    /// ordinary agents.
    fn slots(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the filled roles are enough to start processing.
    ///
    /// The default requires every declared slot.
    fn slots_ready(&self, filled: &BTreeMap<String, String>) -> bool {
        filled.len() == self.slots().len()
    }

    /// Called when the bus reports that every descriptor is processed or
    /// processable by every uniquely-configured agent.
    ///
    /// Idle-mode agents have their buffer drained through
    /// [`bulk_process`] before this hook runs.
    ///
    /// [`bulk_process`]: AgentBehavior::bulk_process
    async fn on_idle(&mut self, bus: &BusClient) -> anyhow::Result<()> {
        let _ = bus;
        Ok(())
    }

    /// Opaque state persisted across restarts; `None` for stateless
    /// agents.
    fn internal_state(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restore state persisted by a previous instance.
    fn set_internal_state(&mut self, state: &[u8]) {
        let _ = state;
    }
}
