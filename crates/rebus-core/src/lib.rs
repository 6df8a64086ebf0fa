// SPDX-License-Identifier: MIT OR Apache-2.0
//! rebus-core
//!
//! The descriptor data model for the REbus fabric.
//!
//! A [`Descriptor`] is an immutable, content-addressed artifact: a typed
//! payload plus lineage, filed under a hierarchical selector whose last
//! component embeds the SHA-256 content hash. Descriptors derived from one
//! another share a sample [`Uuid`]; unrelated samples can still be tied
//! together with link descriptors (see [`link`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Agent configuration and output-altering option signatures.
pub mod config;
/// Error taxonomy shared by the descriptor model.
pub mod error;
/// Two-way link descriptors between independent samples.
pub mod link;
/// Selector and domain grammar: validation, parsing, version references.
pub mod selector;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use error::DescriptorError;
pub use link::{LinkRole, LinkValue};

/// Domain used when a producer does not specify one.
pub const DEFAULT_DOMAIN: &str = "default";

/// Fixed namespace for deriving sample uuids (v5) from content hashes.
///
/// Every root descriptor gets `Uuid::new_v5(&SAMPLE_NAMESPACE, hash)`;
/// derived descriptors inherit their precursor's uuid, so the uuid
/// identifies the whole sample (a root and all its derivatives).
pub const SAMPLE_NAMESPACE: Uuid = Uuid::from_u128(0x8f1c_69f4_2a3d_4b1e_9c70_5d2e_8a41_77d3);

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Payload of a descriptor: raw bytes or structured data.
///
/// Structured payloads are carried as canonical JSON text on the wire and
/// on disk, which keeps the binary wire format self-contained while still
/// allowing agents to exchange maps and lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Opaque byte payload (file contents, extracted blobs).
    Bytes(Vec<u8>),
    /// Structured payload, serialized as canonical JSON text.
    Json(#[serde(with = "json_text")] serde_json::Value),
}

/// Serde helper — `serde_json::Value` carried as its canonical JSON string.
///
/// `serde_json` keys are sorted (`BTreeMap` backing), so the text form is
/// deterministic and safe to hash.
mod json_text {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(val: &serde_json::Value, ser: S) -> Result<S::Ok, S::Error> {
        serde_json::to_string(val)
            .map_err(serde::ser::Error::custom)?
            .serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(de)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

impl Value {
    /// Build a structured value from any serializable type.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, DescriptorError> {
        Ok(Value::Json(
            serde_json::to_value(value).map_err(DescriptorError::ValueEncoding)?,
        ))
    }

    /// Build a structured value holding a plain string.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Value::Json(serde_json::Value::String(text.into()))
    }

    /// Byte payload, if this is a [`Value::Bytes`].
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Json(_) => None,
        }
    }

    /// Textual rendering used for regex matching in value searches.
    ///
    /// Byte payloads are interpreted as lossy UTF-8; structured payloads
    /// match against their canonical JSON form, except plain strings which
    /// match their contents directly.
    #[must_use]
    pub fn search_text(&self) -> String {
        match self {
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Json(serde_json::Value::String(s)) => s.clone(),
            Value::Json(v) => v.to_string(),
        }
    }

    /// Canonical byte form fed to the content hash.
    ///
    /// A tag byte keeps byte payloads and structured payloads from ever
    /// colliding.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => {
                let mut out = Vec::with_capacity(b.len() + 1);
                out.push(0u8);
                out.extend_from_slice(b);
                out
            }
            Value::Json(v) => {
                let mut out = vec![1u8];
                out.extend_from_slice(v.to_string().as_bytes());
                out
            }
        }
    }

    /// Size of the payload in bytes (canonical form, without the tag).
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::Json(v) => v.to_string().len(),
        }
    }
}

// ---------------------------------------------------------------------------
// DescriptorMeta
// ---------------------------------------------------------------------------

/// Metadata of a descriptor: every field except the payload.
///
/// Storage serializes metadata and value separately so listings and filters
/// never load payloads. All fields are frozen at construction; the only
/// mutation ever applied is stamping [`processing_time`] before the first
/// push (see [`DescriptorMeta::set_processing_time`]).
///
/// [`processing_time`]: DescriptorMeta::processing_time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorMeta {
    domain: String,
    selector: String,
    label: String,
    hash: String,
    uuid: Uuid,
    agent: String,
    precursors: Vec<String>,
    version: u32,
    processing_time: Option<f64>,
}

impl DescriptorMeta {
    /// Domain partition this descriptor lives in.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Full selector, `/path/…/%<hash>`.
    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Human-readable label. Display only, not unique.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// SHA-256 content hash, 64 hex characters.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Sample uuid shared by a root descriptor and all its derivatives.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Name of the producing agent.
    #[must_use]
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Selectors of the descriptors this one was derived from, most recent
    /// first.
    #[must_use]
    pub fn precursors(&self) -> &[String] {
        &self.precursors
    }

    /// Version number; `0` unless refined through [`new_version`].
    ///
    /// [`new_version`]: DescriptorMeta::new_version
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Seconds the producer spent computing this descriptor, if stamped.
    #[must_use]
    pub fn processing_time(&self) -> Option<f64> {
        self.processing_time
    }

    /// Stamp the processing time, keeping any value the producer set.
    pub fn set_processing_time(&mut self, seconds: f64) {
        if self.processing_time.is_none() {
            self.processing_time = Some(seconds);
        }
    }

    /// Derive a child descriptor in the same sample.
    ///
    /// The child inherits domain, label and uuid; its hash covers the
    /// producing agent, the full precursor chain, the selector prefix and
    /// the payload, so equal derivations collide and diverging ones never
    /// do.
    pub fn spawn_descriptor(
        &self,
        selector_prefix: &str,
        value: Value,
        agent: &str,
    ) -> Result<Descriptor, DescriptorError> {
        let mut precursors = Vec::with_capacity(self.precursors.len() + 1);
        precursors.push(self.selector.clone());
        precursors.extend(self.precursors.iter().cloned());
        Descriptor::derived(
            self.label.clone(),
            selector_prefix,
            value,
            self.domain.clone(),
            agent,
            precursors,
            self.uuid,
            0,
        )
    }

    /// Derive the next version of this descriptor.
    ///
    /// Same selector prefix, `version + 1`, this descriptor prepended to
    /// the precursor chain. The store's version index makes both versions
    /// addressable through `…/~N` references.
    pub fn new_version(&self, value: Value, agent: &str) -> Result<Descriptor, DescriptorError> {
        let prefix = selector::prefix_of(&self.selector).to_owned();
        let mut precursors = Vec::with_capacity(self.precursors.len() + 1);
        precursors.push(self.selector.clone());
        precursors.extend(self.precursors.iter().cloned());
        Descriptor::derived(
            self.label.clone(),
            &prefix,
            value,
            self.domain.clone(),
            agent,
            precursors,
            self.uuid,
            self.version + 1,
        )
    }

    /// Build the two link descriptors relating this sample to `other`.
    ///
    /// Both links are filed under `/link/<agent>/<link_type>`; the first
    /// carries this descriptor's uuid, the second carries `other`'s, so
    /// each sample sees the relation from its own side. A non-symmetric
    /// link tags the sides `src`/`target`; a symmetric one tags both
    /// `symmetric`.
    pub fn create_links(
        &self,
        other: &DescriptorMeta,
        agent: &str,
        link_type: &str,
        reason: &str,
        symmetric: bool,
    ) -> Result<(Descriptor, Descriptor), DescriptorError> {
        if self.domain != other.domain {
            return Err(DescriptorError::CrossDomainLink {
                a: self.domain.clone(),
                b: other.domain.clone(),
            });
        }
        let prefix = format!("/link/{agent}/{link_type}");
        selector::validate_prefix(&prefix)?;
        let (role_a, role_b) = if symmetric {
            (LinkRole::Symmetric, LinkRole::Symmetric)
        } else {
            (LinkRole::Src, LinkRole::Target)
        };
        let make = |uuid: Uuid, role: LinkRole| -> Result<Descriptor, DescriptorError> {
            let value = Value::json(&LinkValue {
                selector_a: self.selector.clone(),
                selector_b: other.selector.clone(),
                reason: reason.to_owned(),
                role,
            })?;
            Descriptor::derived(
                reason.to_owned(),
                &prefix,
                value,
                self.domain.clone(),
                agent,
                vec![self.selector.clone(), other.selector.clone()],
                uuid,
                0,
            )
        };
        Ok((make(self.uuid, role_a)?, make(other.uuid, role_b)?))
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// An immutable, content-addressed artifact: metadata plus payload.
///
/// Constructed once, added to the store exactly once, never mutated or
/// deleted. `Descriptor` dereferences to [`DescriptorMeta`] for all
/// metadata accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    meta: DescriptorMeta,
    value: Value,
}

impl std::ops::Deref for Descriptor {
    type Target = DescriptorMeta;

    fn deref(&self) -> &DescriptorMeta {
        &self.meta
    }
}

impl Descriptor {
    /// Create a root descriptor: fresh sample, no lineage.
    ///
    /// The hash covers the payload alone, so injecting the same bytes
    /// twice yields the same selector (and the second add is a no-op).
    pub fn new(
        label: impl Into<String>,
        selector_prefix: &str,
        value: Value,
        domain: impl Into<String>,
        agent: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let hash = root_hash(&value);
        Self::with_hash(label, selector_prefix, value, domain, agent, hash)
    }

    /// Create a root descriptor with a random hash.
    ///
    /// Used for forced re-injections: the selector is guaranteed absent
    /// from the store and the descriptor gets a fresh sample uuid.
    pub fn new_with_randomhash(
        label: impl Into<String>,
        selector_prefix: &str,
        value: Value,
        domain: impl Into<String>,
        agent: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let hash = hex::encode(rand::random::<[u8; 32]>());
        Self::with_hash(label, selector_prefix, value, domain, agent, hash)
    }

    fn with_hash(
        label: impl Into<String>,
        selector_prefix: &str,
        value: Value,
        domain: impl Into<String>,
        agent: impl Into<String>,
        hash: String,
    ) -> Result<Self, DescriptorError> {
        let domain = domain.into();
        selector::validate_domain(&domain)?;
        selector::validate_prefix(selector_prefix)?;
        let selector = selector::join_hash(selector_prefix, &hash);
        let uuid = Uuid::new_v5(&SAMPLE_NAMESPACE, hash.as_bytes());
        Ok(Descriptor {
            meta: DescriptorMeta {
                domain,
                selector,
                label: label.into(),
                hash,
                uuid,
                agent: agent.into(),
                precursors: Vec::new(),
                version: 0,
                processing_time: None,
            },
            value,
        })
    }

    /// Shared construction path for derived descriptors.
    #[allow(clippy::too_many_arguments)]
    fn derived(
        label: String,
        selector_prefix: &str,
        value: Value,
        domain: String,
        agent: &str,
        precursors: Vec<String>,
        uuid: Uuid,
        version: u32,
    ) -> Result<Self, DescriptorError> {
        selector::validate_domain(&domain)?;
        selector::validate_prefix(selector_prefix)?;
        let hash = derived_hash(agent, &precursors, selector_prefix, version, &value);
        let selector = selector::join_hash(selector_prefix, &hash);
        Ok(Descriptor {
            meta: DescriptorMeta {
                domain,
                selector,
                label,
                hash,
                uuid,
                agent: agent.to_owned(),
                precursors,
                version,
                processing_time: None,
            },
            value,
        })
    }

    /// Reassemble a descriptor from separately stored metadata and payload.
    #[must_use]
    pub fn from_parts(meta: DescriptorMeta, value: Value) -> Self {
        Descriptor { meta, value }
    }

    /// Split into metadata and payload for separate storage.
    #[must_use]
    pub fn into_parts(self) -> (DescriptorMeta, Value) {
        (self.meta, self.value)
    }

    /// Metadata view of this descriptor.
    #[must_use]
    pub fn meta(&self) -> &DescriptorMeta {
        &self.meta
    }

    /// Mutable metadata access, for stamping the processing time.
    pub fn meta_mut(&mut self) -> &mut DescriptorMeta {
        &mut self.meta
    }

    /// The payload.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self.value.search_text();
        if text.len() > 30 {
            write!(
                f,
                "{}:{}({})=[{}]{:.22}…",
                self.domain(),
                self.selector(),
                self.label(),
                self.value.size(),
                text
            )
        } else {
            write!(
                f,
                "{}:{}({})={}",
                self.domain(),
                self.selector(),
                self.label(),
                text
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Hash of a root descriptor: SHA-256 over the canonical payload bytes.
fn root_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.canonical_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a derived descriptor.
///
/// Every component is length-prefixed before hashing, which makes the
/// encoding injective: no pair of distinct (agent, precursors, prefix,
/// version, value) inputs can produce the same byte stream.
fn derived_hash(
    agent: &str,
    precursors: &[String],
    selector_prefix: &str,
    version: u32,
    value: &Value,
) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    };
    feed(agent.as_bytes());
    feed(&(precursors.len() as u64).to_be_bytes());
    for p in precursors {
        feed(p.as_bytes());
    }
    feed(selector_prefix.as_bytes());
    feed(&version.to_be_bytes());
    feed(&value.canonical_bytes());
    format!("{:x}", hasher.finalize())
}
