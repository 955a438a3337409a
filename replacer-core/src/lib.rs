//! Replacer Core Library
//!
//! This library provides the rule-driven interception engine of a MITM
//! proxy: HTTP packet decomposition, regex rule matching, packet rewriting,
//! flow coloring and the extra-repeat side channel.

pub mod codec;
pub mod cookie;
pub mod packet;

/// Rules, matching and rewriting
pub mod matcher;
pub mod rewriter;
pub mod rule;

/// Rule set manager and interception pipeline
pub mod color;
pub mod filter;
pub mod hook;
pub mod registry;
pub mod repeat;
pub mod replacer;

/// Configuration types and utilities
pub mod config;

/// Error types for replacer operations
pub mod error;

pub mod metrics;

use std::any::Any;

pub use color::RequestContext;
pub use config::{RepeatConfig, ReplacerConfig};
pub use error::ReplacerError;
pub use filter::EffectiveUrlFilter;
pub use hook::{HookOptions, HookOutcome};
pub use matcher::{MatchMetaInfo, MatchResult};
pub use metrics::{MetricsSnapshot, ReplacerMetrics};
pub use packet::{split_packet, PacketInfo};
pub use registry::MatchedRuleRegistry;
pub use repeat::{HttpRepeatSender, RepeatRequest, RepeatSender};
pub use replacer::{MitmReplacer, RuleSetSnapshot};
/// Re-export commonly used types
pub use replacer_common::{
    ClientExchange, ColorFlow, ExtractedData, FlowColor, HttpFlow, RuleConfig, WebSocketFlow,
};
pub use rule::ReplaceRule;

/// Result type alias for replacer operations
pub type Result<T> = std::result::Result<T, ReplacerError>;

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
