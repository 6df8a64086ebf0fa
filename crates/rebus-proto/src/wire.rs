// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pluggable wire serialization.
//!
//! The same formats serve the broker socket and the on-disk descriptor
//! files. [`Wire::Bin`] is the default everywhere; [`Wire::Json`] exists
//! for debugging sessions and config-signature work where a human needs
//! to read the bytes.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Serialization format for messages and stored descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wire {
    /// Compact binary encoding; default on sockets and on disk.
    #[default]
    Bin,
    /// JSON text encoding, for debugging.
    Json,
}

impl Wire {
    /// Encode a value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        match self {
            Wire::Bin => bincode::serialize(value).map_err(WireError::Bin),
            Wire::Json => serde_json::to_vec(value).map_err(WireError::Json),
        }
    }

    /// Decode a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, WireError> {
        match self {
            Wire::Bin => bincode::deserialize(bytes).map_err(WireError::Bin),
            Wire::Json => serde_json::from_slice(bytes).map_err(WireError::Json),
        }
    }

    /// Format name for logs and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Wire::Bin => "bin",
            Wire::Json => "json",
        }
    }
}

/// Serialization or framing failure.
#[derive(Debug, Error)]
pub enum WireError {
    /// Binary encode/decode failure.
    #[error("binary serialization failed")]
    Bin(#[source] bincode::Error),

    /// JSON encode/decode failure.
    #[error("json serialization failed")]
    Json(#[source] serde_json::Error),

    /// A frame exceeded the configured size cap.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Socket read/write failure.
    #[error("frame i/o failed")]
    Io(#[from] std::io::Error),
}
