//! Content Replacer Rule Configuration
//!
//! This module defines the rule structures shared between the interception
//! engine and whoever persists the rule list (the key-value store, the UI).
//! Field names serialize the way the stored JSON spells them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single MITM content replacer rule as configured by the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuleConfig {
    /// Human-readable rule name
    pub verbose_name: String,

    /// Priority, lower runs first
    pub index: i64,

    pub disabled: bool,

    /// Match pattern (extended regex, or plain text)
    pub rule: String,

    /// Replacement template, may reference capture groups (`$1`, `${name}`)
    pub result: String,

    pub enable_for_request: bool,
    pub enable_for_response: bool,
    #[serde(rename = "EnableForURI")]
    pub enable_for_uri: bool,
    pub enable_for_header: bool,
    pub enable_for_body: bool,

    /// Observation only: never rewrite, only color/tag/extract
    pub no_replace: bool,

    /// Flow color applied when the rule matches
    pub color: String,

    /// Tags appended to the flow when the rule matches
    pub extra_tag: Vec<String>,

    /// Structured header overrides (switches rewriting to key/value mode)
    pub extra_headers: Vec<HeaderOverride>,

    /// Structured cookie overrides (switches rewriting to key/value mode)
    pub extra_cookies: Vec<CookieOverride>,

    /// Discard the intercepted exchange when matched
    pub drop: bool,

    /// Resend the rewritten request as a side exchange instead of forwarding it
    pub extra_repeat: bool,

    /// Only apply to request URLs matching this pattern
    #[serde(rename = "EffectiveURL")]
    pub effective_url: String,

    /// Capture groups to extract when reporting a match
    pub regexp_groups: Vec<i64>,
}

impl RuleConfig {
    /// Create a rule with a pattern and a replacement template
    pub fn new(rule: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            result: result.into(),
            ..Default::default()
        }
    }

    /// True when the rule rewrites headers/cookies by key instead of by pattern
    pub fn has_structured_overrides(&self) -> bool {
        !self.extra_headers.is_empty() || !self.extra_cookies.is_empty()
    }

    /// True when the rule is enabled for at least one direction
    pub fn has_direction(&self) -> bool {
        self.enable_for_request || self.enable_for_response
    }
}

impl fmt::Display for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Header value forced onto matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeaderOverride {
    pub header: String,
    pub value: String,
}

impl HeaderOverride {
    pub fn new(header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            value: value.into(),
        }
    }
}

/// Cookie forced onto matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CookieOverride {
    pub key: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    /// Unix seconds
    pub expires: i64,
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site_mode: String,
}

impl CookieOverride {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Parsed SameSite attribute.
    ///
    /// `Ok(None)` when unset, `Err` with the raw value when it is not one of
    /// default/lax/strict/none.
    pub fn same_site(&self) -> Result<Option<SameSite>, String> {
        match self.same_site_mode.as_str() {
            "" => Ok(None),
            "default" => Ok(Some(SameSite::Default)),
            "lax" => Ok(Some(SameSite::Lax)),
            "strict" => Ok(Some(SameSite::Strict)),
            "none" => Ok(Some(SameSite::None)),
            other => Err(other.to_string()),
        }
    }
}

/// Cookie SameSite attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Default,
    Lax,
    Strict,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_config_json_field_names() {
        let json = r#"{
            "VerboseName": "token",
            "Index": 3,
            "Rule": "abc",
            "Result": "def",
            "EnableForRequest": true,
            "EnableForURI": true,
            "EffectiveURL": "example\\.com",
            "ExtraHeaders": [{"Header": "X-A", "Value": "1"}],
            "RegexpGroups": [1, 2]
        }"#;
        let rule: RuleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(rule.verbose_name, "token");
        assert_eq!(rule.index, 3);
        assert!(rule.enable_for_request);
        assert!(rule.enable_for_uri);
        assert!(!rule.enable_for_response);
        assert_eq!(rule.effective_url, "example\\.com");
        assert_eq!(rule.extra_headers, vec![HeaderOverride::new("X-A", "1")]);
        assert_eq!(rule.regexp_groups, vec![1, 2]);
        assert!(rule.has_structured_overrides());
    }

    #[test]
    fn test_rule_display_is_json() {
        let rule = RuleConfig::new("foo", "bar");
        let rendered = rule.to_string();
        assert!(rendered.contains(r#""Rule":"foo""#));
        assert!(rendered.contains(r#""Result":"bar""#));
    }

    #[test]
    fn test_cookie_same_site() {
        let mut cookie = CookieOverride::new("sid", "1");
        assert_eq!(cookie.same_site(), Ok(None));
        cookie.same_site_mode = "lax".to_string();
        assert_eq!(cookie.same_site(), Ok(Some(SameSite::Lax)));
        cookie.same_site_mode = "sometimes".to_string();
        assert_eq!(cookie.same_site(), Err("sometimes".to_string()));
    }
}
