//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replacer engine configuration.
/// These settings are fixed when the replacer is built; rules are reloaded
/// separately at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacerConfig {
    /// Backtracking budget per regex search; exceeding it is a match timeout
    pub backtrack_limit: usize,
    /// Extra repeat configuration
    pub repeat: RepeatConfig,
    /// Prefix of the tag that carries a rule color onto a resent flow
    pub color_tag_prefix: String,
}

impl Default for ReplacerConfig {
    fn default() -> Self {
        Self {
            backtrack_limit: 1_000_000,
            repeat: RepeatConfig::default(),
            color_tag_prefix: "COLOR_".to_string(),
        }
    }
}

/// Extra repeat (asynchronous resend) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    /// Timeout for the resend in seconds
    pub timeout_secs: u64,
    /// Redirects followed by the resend
    pub redirect_times: usize,
    /// Source recorded on the resent flow
    pub source: String,
    /// Prefix for tags on the resent flow
    pub tag_prefix: String,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            redirect_times: 0,
            source: "mitm".to_string(),
            tag_prefix: "[repeat]".to_string(),
        }
    }
}

impl RepeatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
