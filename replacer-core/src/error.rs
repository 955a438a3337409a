//! Error types for replacer operations

use thiserror::Error;

/// Main error type for replacer operations
#[derive(Debug, Error)]
pub enum ReplacerError {
    /// Pattern failed to compile, even as an escaped literal
    #[error("Compile error: rule {rule:?}: {reason}")]
    Compile { rule: String, reason: String },

    /// The regex engine gave up on a pathological input
    #[error("match timeout: rule {rule:?}")]
    MatchTimeout { rule: String },

    /// Any other regex runtime failure
    #[error("Match error: {0}")]
    Match(String),

    /// Chunked or gzip decoding failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Key/value header rewriting attempted on a response
    #[error("Structured replace error: {0}")]
    StructuredReplace(String),

    /// Packet could not be parsed as HTTP
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Extra repeat could not be sent
    #[error("Repeat error: {0}")]
    Repeat(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplacerError {
    /// Match timeouts only mean "no match from this rule"
    pub fn is_match_timeout(&self) -> bool {
        matches!(self, ReplacerError::MatchTimeout { .. })
    }

    /// Map a regex runtime error, recognising backtrack-limit overruns
    pub(crate) fn from_regex(rule: &str, err: fancy_regex::Error) -> Self {
        match err {
            fancy_regex::Error::RuntimeError(fancy_regex::RuntimeError::BacktrackLimitExceeded) => {
                ReplacerError::MatchTimeout {
                    rule: rule.to_string(),
                }
            }
            other => ReplacerError::Match(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ReplacerError {
    fn from(err: reqwest::Error) -> Self {
        ReplacerError::Repeat(err.to_string())
    }
}

impl From<serde_json::Error> for ReplacerError {
    fn from(err: serde_json::Error) -> Self {
        ReplacerError::Configuration(err.to_string())
    }
}
