// SPDX-License-Identifier: MIT OR Apache-2.0
//! Errors raised while constructing descriptors.
//!
//! Validation happens at construction; malformed selectors or domains can
//! never reach storage.

use thiserror::Error;

/// Error constructing or encoding a descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The domain contains characters outside `[A-Za-z0-9-]`.
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),

    /// The selector is outside the selector grammar.
    #[error("invalid selector {0:?}")]
    InvalidSelector(String),

    /// The selector prefix contains a hash/version suffix or forbidden
    /// characters.
    #[error("invalid selector prefix {0:?}")]
    InvalidPrefix(String),

    /// Link descriptors can only relate samples within one domain.
    #[error("cannot link descriptors across domains {a:?} and {b:?}")]
    CrossDomainLink {
        /// Domain of the first descriptor.
        a: String,
        /// Domain of the second descriptor.
        b: String,
    },

    /// A structured payload failed to serialize.
    #[error("value encoding failed")]
    ValueEncoding(#[source] serde_json::Error),
}
