//! Shared types for the MITM content replacer
//!
//! Rule configuration as persisted by the operator, and the flow/annotation
//! types the interception engine hands back to its collaborators.

pub mod flow;
pub mod rule;

pub use flow::{
    ClientExchange, ColorFlow, ExtractedData, FlowColor, HttpFlow, WebSocketFlow,
    SOURCE_TYPE_HTTPFLOW,
};
pub use rule::{CookieOverride, HeaderOverride, RuleConfig, SameSite};
