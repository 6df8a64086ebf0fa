// SPDX-License-Identifier: MIT OR Apache-2.0
//! Link descriptors: how two independent samples become related.
//!
//! [`DescriptorMeta::create_links`] produces a pair of descriptors under
//! `/link/<agent>/<type>`, one filed under each sample's uuid. The payload
//! of both is a [`LinkValue`] naming the two selectors, the reason, and
//! which side of the relation the carrying sample is on.
//!
//! [`DescriptorMeta::create_links`]: crate::DescriptorMeta::create_links

use serde::{Deserialize, Serialize};

/// Which side of a link the carrying descriptor represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// The carrying sample is the origin of the relation.
    Src,
    /// The carrying sample is the target of the relation.
    Target,
    /// The relation has no direction; both links carry this role.
    Symmetric,
}

/// Payload of a link descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkValue {
    /// Selector of the first linked descriptor.
    pub selector_a: String,
    /// Selector of the second linked descriptor.
    pub selector_b: String,
    /// Free-form reason the producing agent linked the two.
    pub reason: String,
    /// Side of the relation this link's sample is on.
    pub role: LinkRole,
}
