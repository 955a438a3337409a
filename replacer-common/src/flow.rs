//! Recorded traffic flows and the annotations rules attach to them.
//!
//! Mirror rules never touch packet bytes; what they produce lands here:
//! a color, a set of tags and extracted-data records keyed by the flow's
//! hidden index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Source type recorded on data extracted from HTTP flows
pub const SOURCE_TYPE_HTTPFLOW: &str = "httpflow";

/// Fixed palette of flow colors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowColor {
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Grey,
}

impl FlowColor {
    pub fn name(&self) -> &'static str {
        match self {
            FlowColor::Red => "red",
            FlowColor::Green => "green",
            FlowColor::Blue => "blue",
            FlowColor::Yellow => "yellow",
            FlowColor::Orange => "orange",
            FlowColor::Purple => "purple",
            FlowColor::Cyan => "cyan",
            FlowColor::Grey => "grey",
        }
    }
}

impl fmt::Display for FlowColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlowColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(FlowColor::Red),
            "green" => Ok(FlowColor::Green),
            "blue" => Ok(FlowColor::Blue),
            "yellow" => Ok(FlowColor::Yellow),
            "orange" => Ok(FlowColor::Orange),
            "purple" => Ok(FlowColor::Purple),
            "cyan" => Ok(FlowColor::Cyan),
            "grey" => Ok(FlowColor::Grey),
            other => Err(format!("unknown flow color: {}", other)),
        }
    }
}

/// Anything that can be colored and tagged by mirror rules
pub trait ColorFlow {
    /// Stable identity used to key extracted data
    fn hidden_index(&self) -> &str;

    /// URL the flow was recorded for; empty when it has none
    fn url(&self) -> &str {
        ""
    }

    fn set_color(&mut self, color: FlowColor);

    fn add_tags(&mut self, tags: &[String]);
}

fn push_unique_tags(existing: &mut Vec<String>, tags: &[String]) {
    for tag in tags {
        if !existing.contains(tag) {
            existing.push(tag.clone());
        }
    }
}

/// A recorded HTTP exchange seen by the proxy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpFlow {
    pub hidden_index: String,
    pub url: String,
    pub tags: Vec<String>,
    pub color: Option<FlowColor>,
}

impl HttpFlow {
    pub fn new(hidden_index: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            hidden_index: hidden_index.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

impl ColorFlow for HttpFlow {
    fn hidden_index(&self) -> &str {
        &self.hidden_index
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn set_color(&mut self, color: FlowColor) {
        self.color = Some(color);
    }

    fn add_tags(&mut self, tags: &[String]) {
        push_unique_tags(&mut self.tags, tags);
    }
}

/// A recorded WebSocket frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketFlow {
    pub hidden_index: String,
    pub frame_index: u64,
    pub tags: Vec<String>,
    pub color: Option<FlowColor>,
}

impl ColorFlow for WebSocketFlow {
    fn hidden_index(&self) -> &str {
        &self.hidden_index
    }

    fn set_color(&mut self, color: FlowColor) {
        self.color = Some(color);
    }

    fn add_tags(&mut self, tags: &[String]) {
        push_unique_tags(&mut self.tags, tags);
    }
}

/// An exchange issued by the engine's own HTTP client (e.g. an extra repeat)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientExchange {
    pub hidden_index: String,
    pub url: String,
    pub raw_request: Vec<u8>,
    pub raw_response: Vec<u8>,
    /// Where the exchange originated, e.g. "mitm"
    pub source: String,
    pub tags: Vec<String>,
    pub color: Option<FlowColor>,
}

impl ClientExchange {
    /// Assign a fresh hidden index if the exchange has none yet
    pub fn ensure_hidden_index(&mut self) -> &str {
        if self.hidden_index.is_empty() {
            self.hidden_index = uuid::Uuid::new_v4().to_string();
        }
        &self.hidden_index
    }
}

impl ColorFlow for ClientExchange {
    fn hidden_index(&self) -> &str {
        &self.hidden_index
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn set_color(&mut self, color: FlowColor) {
        self.color = Some(color);
    }

    fn add_tags(&mut self, tags: &[String]) {
        push_unique_tags(&mut self.tags, tags);
    }
}

/// One value extracted from a flow by a mirror rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub source_type: String,
    /// Hidden index of the flow the data came from
    pub trace_id: String,
    /// Rule string form
    pub regexp: String,
    pub rule_verbose: String,
    pub data: String,
    /// Absolute byte offset of the match in the packet
    pub data_index: usize,
    pub length: usize,
    pub is_match_request: bool,
}
