// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent configuration and configuration signatures.
//!
//! Every agent declares which of its options alter the *content* of what
//! it publishes. Two signatures are derived from a configuration: the
//! full-config string (logging, diagnostics) and the output-config string
//! (the canonicalized output-altering subset). Locking, uniqueness and
//! processed/processable accounting all key on the output-config form, so
//! cosmetic option differences do not fragment the work set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How an agent reacts to descriptor signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Process every matching descriptor as it arrives.
    #[default]
    Automatic,
    /// Only mark descriptors processable; process on explicit user request.
    Interactive,
    /// Buffer matching descriptors; process the batch when the bus idles.
    Idle,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationMode::Automatic => "automatic",
            OperationMode::Interactive => "interactive",
            OperationMode::Idle => "idle",
        })
    }
}

/// Configuration an agent registers with.
///
/// `options` is the agent-specific option map; `output_altering_options`
/// names the keys whose values influence published descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Logical agent name; all instances of one analysis share it.
    pub name: String,
    /// Domain this agent subscribes to.
    pub domain: String,
    /// Operation mode.
    pub mode: OperationMode,
    /// Retry attempts after a processing failure.
    pub retries: u32,
    /// Delay between retry attempts, in seconds.
    pub retry_wait_secs: f64,
    /// Agent-specific options.
    pub options: BTreeMap<String, serde_json::Value>,
    /// Keys of `options` that alter published output.
    pub output_altering_options: Vec<String>,
}

impl AgentConfig {
    /// Configuration with defaults: automatic mode, no retries, domain
    /// `default`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        AgentConfig {
            name: name.into(),
            domain: crate::DEFAULT_DOMAIN.to_owned(),
            mode: OperationMode::Automatic,
            retries: 0,
            retry_wait_secs: 1.0,
            options: BTreeMap::new(),
            output_altering_options: Vec::new(),
        }
    }

    /// Set an option value.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Declare an option as output-altering.
    #[must_use]
    pub fn with_output_altering(mut self, key: impl Into<String>) -> Self {
        self.output_altering_options.push(key.into());
        self
    }

    /// Full configuration signature: canonical JSON of the whole option
    /// map plus the output-altering declaration.
    ///
    /// This is the string agents send along with `register`; the master
    /// derives the output signature from it.
    #[must_use]
    pub fn full_signature(&self) -> String {
        let mut map = self.options.clone();
        map.insert(
            "output_altering_options".to_owned(),
            serde_json::Value::from(self.output_altering_options.clone()),
        );
        // BTreeMap keys serialize sorted, so this is deterministic.
        serde_json::to_string(&map).unwrap_or_default()
    }

    /// Output-config signature: canonical JSON of the output-altering
    /// subset only.
    #[must_use]
    pub fn output_signature(&self) -> String {
        output_altering_signature(&self.full_signature()).unwrap_or_default()
    }
}

/// Error extracting the output-altering subset from a serialized config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The registered configuration string is not a JSON object.
    #[error("configuration is not a JSON object")]
    NotAnObject,
    /// The configuration string failed to parse.
    #[error("configuration failed to parse")]
    Parse(#[source] serde_json::Error),
}

/// Derive the output-config signature from a full-config string.
///
/// The input is the JSON object produced by [`AgentConfig::full_signature`]
/// whose `output_altering_options` key lists the option keys that alter
/// output. Keys listed but absent from the object are skipped. The result
/// is canonical: equal subsets always produce equal strings.
pub fn output_altering_signature(config_json: &str) -> Result<String, ConfigError> {
    let parsed: serde_json::Value =
        serde_json::from_str(config_json).map_err(ConfigError::Parse)?;
    let obj = parsed.as_object().ok_or(ConfigError::NotAnObject)?;
    let declared: Vec<String> = obj
        .get("output_altering_options")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let subset: BTreeMap<&str, &serde_json::Value> = declared
        .iter()
        .filter_map(|k| obj.get(k.as_str()).map(|v| (k.as_str(), v)))
        .collect();
    serde_json::to_string(&subset).map_err(ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cosmetic_options_do_not_change_output_signature() {
        let a = AgentConfig::new("unarchive")
            .with_option("depth", json!(3))
            .with_option("verbose", json!(true))
            .with_output_altering("depth");
        let b = AgentConfig::new("unarchive")
            .with_option("depth", json!(3))
            .with_option("verbose", json!(false))
            .with_output_altering("depth");
        assert_eq!(a.output_signature(), b.output_signature());
        assert_ne!(a.full_signature(), b.full_signature());
    }

    #[test]
    fn output_altering_options_change_the_signature() {
        let a = AgentConfig::new("unarchive")
            .with_option("depth", json!(3))
            .with_output_altering("depth");
        let b = AgentConfig::new("unarchive")
            .with_option("depth", json!(5))
            .with_output_altering("depth");
        assert_ne!(a.output_signature(), b.output_signature());
    }

    #[test]
    fn signature_is_derivable_from_the_full_string() {
        let cfg = AgentConfig::new("x")
            .with_option("a", json!(1))
            .with_option("b", json!("two"))
            .with_output_altering("b");
        let derived = output_altering_signature(&cfg.full_signature()).unwrap();
        assert_eq!(derived, cfg.output_signature());
    }

    #[test]
    fn declared_but_absent_keys_are_skipped() {
        let sig = output_altering_signature(
            r#"{"output_altering_options":["missing"],"present":1}"#,
        )
        .unwrap();
        assert_eq!(sig, "{}");
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(output_altering_signature("not json").is_err());
        assert!(output_altering_signature("[1,2]").is_err());
    }
}
