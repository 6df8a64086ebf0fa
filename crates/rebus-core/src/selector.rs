// SPDX-License-Identifier: MIT OR Apache-2.0
//! Selector and domain grammar.
//!
//! A selector is a hierarchical path ending in either a content hash
//! (`/binary/elf/%<64 hex>`) or a relative version reference
//! (`/graph/dot/~-1`). Domains are short flat identifiers. Anything
//! outside the grammar is rejected before it can reach storage or the
//! filesystem.

use crate::error::DescriptorError;
use regex::Regex;
use std::sync::LazyLock;

/// Full selector grammar: path, then optionally `%hash` or `~version`.
static SELECTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9/_-]+(|%[a-f0-9]{64}|~-?\d+)$").unwrap());

/// Selector prefix grammar: path only, no hash or version suffix.
static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9/_-]+$").unwrap());

/// Domain grammar.
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").unwrap());

/// Validate a full selector (with or without hash/version suffix).
pub fn validate_selector(selector: &str) -> Result<(), DescriptorError> {
    if SELECTOR_RE.is_match(selector) {
        Ok(())
    } else {
        Err(DescriptorError::InvalidSelector(selector.to_owned()))
    }
}

/// Validate a selector prefix (the part a producer chooses).
pub fn validate_prefix(prefix: &str) -> Result<(), DescriptorError> {
    if PREFIX_RE.is_match(prefix) {
        Ok(())
    } else {
        Err(DescriptorError::InvalidPrefix(prefix.to_owned()))
    }
}

/// Validate a domain identifier.
pub fn validate_domain(domain: &str) -> Result<(), DescriptorError> {
    if DOMAIN_RE.is_match(domain) {
        Ok(())
    } else {
        Err(DescriptorError::InvalidDomain(domain.to_owned()))
    }
}

/// Append a content hash to a prefix: `/raw` + `abc…` → `/raw/%abc…`.
#[must_use]
pub fn join_hash(prefix: &str, hash: &str) -> String {
    format!("{}/%{hash}", prefix.trim_end_matches('/'))
}

/// Content hash embedded in a selector, if present.
#[must_use]
pub fn hash_of(selector: &str) -> Option<&str> {
    selector.rsplit_once('%').map(|(_, h)| h)
}

/// Selector path without the `/%hash` suffix (trailing slash trimmed).
#[must_use]
pub fn prefix_of(selector: &str) -> &str {
    match selector.rsplit_once('%') {
        Some((prefix, _)) => prefix.trim_end_matches('/'),
        None => selector,
    }
}

/// Parse a relative version reference.
///
/// Returns `(prefix, n)` for selectors of the form `/path/~N`; `None` for
/// hash-addressed or malformed selectors. Negative `n` counts back from
/// the latest known version.
#[must_use]
pub fn version_ref(selector: &str) -> Option<(&str, i64)> {
    if selector.contains('%') {
        return None;
    }
    let (prefix, version) = selector.rsplit_once('~')?;
    let n = version.parse::<i64>().ok()?;
    Some((prefix.trim_end_matches('/'), n))
}
