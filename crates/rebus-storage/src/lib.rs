// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-storage
//!
//! Append-only descriptor stores plus the metadata indices the master
//! needs to route work: processed/processable accounting, selector and
//! uuid lookups, lineage edges, version references, and per-agent internal
//! state.
//!
//! Two backends implement the [`Storage`] contract: [`RamStorage`]
//! (everything in memory, no persistence) and [`DiskStorage`]
//! (descriptors on the filesystem, processed marks in a sqlite companion
//! index, rediscovery on startup).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// On-disk backend: `.meta`/`.value` tree plus sqlite index.
pub mod disk;
/// Sqlite companion index used by the disk backend.
pub mod index;
/// In-memory backend.
pub mod ram;

pub use disk::DiskStorage;
pub use ram::RamStorage;

use rebus_core::{Descriptor, DescriptorMeta, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// An (agent name, output-config signature) pair, the unit of processing
/// accounting.
pub type NameConfig = (String, String);

/// Failure inside a storage backend.
///
/// Backends fail loudly at startup when the backing store is corrupt;
/// runtime lookups of unknown selectors return `None` instead of erroring.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("storage i/o failed on {path}")]
    Io {
        /// Path the operation touched.
        path: std::path::PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The sqlite companion index failed.
    #[error("metadata index failed")]
    Index(#[from] rusqlite::Error),

    /// Descriptor (de)serialization failed.
    #[error("descriptor serialization failed")]
    Wire(#[from] rebus_proto::WireError),

    /// The on-disk tree contradicts itself (orphan value, hash or domain
    /// mismatch, foreign file).
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// A caller-supplied search pattern failed to compile.
    #[error("invalid search pattern")]
    Pattern(#[from] regex::Error),

    /// Descriptor-level validation failed.
    #[error(transparent)]
    Descriptor(#[from] rebus_core::DescriptorError),
}

/// Contract shared by all descriptor stores.
///
/// All operations are keyed by domain unless noted. The master is the
/// only caller; it serializes access on its loop, so implementations only
/// need interior synchronization where they run background work of their
/// own (the disk backend's checkpoint thread).
pub trait Storage: Send {
    /// Backend name as selected on the command line.
    fn backend_name(&self) -> &'static str;

    /// Whether this backend persists agents' internal state.
    fn stores_internal_state(&self) -> bool;

    /// Insert a descriptor. Returns `false` (and changes nothing) when
    /// `(domain, selector)` already exists. All indices are updated
    /// together.
    fn add(&mut self, descriptor: Descriptor) -> Result<bool, StorageError>;

    /// Fetch descriptor metadata. Resolves `~N` version references.
    /// Returns `None` for unknown selectors.
    fn get_descriptor(&self, domain: &str, selector: &str) -> Option<DescriptorMeta>;

    /// Fetch a descriptor's payload. Resolves `~N` version references.
    fn get_value(&self, domain: &str, selector: &str) -> Option<Value>;

    /// Selectors matching `selector_regex` (anchored at the selector
    /// start), most recently added first. `limit == 0` means unlimited.
    fn find(
        &self,
        domain: &str,
        selector_regex: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// Descriptors whose selector starts with `prefix`, most recent
    /// first. `limit == 0` means unlimited.
    fn find_by_selector(
        &self,
        domain: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<DescriptorMeta>;

    /// All descriptors belonging to a sample.
    fn find_by_uuid(&self, domain: &str, uuid: Uuid) -> Vec<DescriptorMeta>;

    /// Descriptors under `prefix` whose payload matches `value_regex`.
    ///
    /// Full scan of the payloads under the prefix: cost is
    /// O(candidates · value size).
    fn find_by_value(
        &self,
        domain: &str,
        prefix: &str,
        value_regex: &str,
    ) -> Result<Vec<DescriptorMeta>, StorageError>;

    /// Map of known sample uuids to their labels. The label of a
    /// precursor-less descriptor wins when the sample has several.
    fn list_uuids(&self, domain: &str) -> BTreeMap<Uuid, String>;

    /// Descriptors derived from `selector`, optionally transitively.
    fn get_children(&self, domain: &str, selector: &str, recurse: bool) -> Vec<DescriptorMeta>;

    /// Record that `(agent, config)` finished (or declined) `selector`.
    ///
    /// Returns `true` iff the pair was in neither the processed nor the
    /// processable set; the pair is removed from processable either way.
    /// Unknown selectors are ignored and return `false`.
    fn mark_processed(
        &mut self,
        domain: &str,
        selector: &str,
        agent_name: &str,
        config: &str,
    ) -> bool;

    /// Record that `(agent, config)`, running interactively, could
    /// process `selector`.
    ///
    /// Returns `true` iff the pair is newly processable and not already
    /// processed.
    fn mark_processable(
        &mut self,
        domain: &str,
        selector: &str,
        agent_name: &str,
        config: &str,
    ) -> bool;

    /// Pairs that have processed (or declined) `selector`.
    fn get_processed(&self, domain: &str, selector: &str) -> Vec<NameConfig>;

    /// Pairs that could process `selector` on request.
    fn get_processable(&self, domain: &str, selector: &str) -> Vec<NameConfig>;

    /// Per-agent-name distinct processed selector counts, plus the total
    /// number of selectors stored in the domain.
    fn processed_stats(&self, domain: &str) -> (Vec<(String, u64)>, u64);

    /// Persist an agent's opaque internal state.
    fn store_agent_state(&mut self, agent_name: &str, state: &[u8]) -> Result<(), StorageError>;

    /// Load an agent's persisted internal state; empty if none.
    fn load_agent_state(&self, agent_name: &str) -> Vec<u8>;

    /// Flush any dirty index state to durable storage.
    fn store_state(&mut self) -> Result<(), StorageError>;

    /// Every `(domain, uuid, selector)` not yet processed by
    /// `(agent_name, config)`, across all domains. Drives replay when an
    /// agent (re)joins.
    fn list_unprocessed_by_agent(
        &self,
        agent_name: &str,
        config: &str,
    ) -> Vec<(String, Uuid, String)>;
}

/// Anchor a caller-supplied pattern at the start of the haystack, the way
/// selector searches have always matched.
pub(crate) fn anchored(pattern: &str) -> String {
    format!("^(?:{pattern})")
}
