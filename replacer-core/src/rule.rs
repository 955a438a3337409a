//! A single content replacer rule and its compiled-pattern cache.

use crate::error::ReplacerError;
use crate::Result;
use fancy_regex::{Regex, RegexBuilder};
use replacer_common::RuleConfig;
use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Default backtracking budget for one regex search
pub const DEFAULT_BACKTRACK_LIMIT: usize = 1_000_000;

fn build(pattern: &str, backtrack_limit: usize) -> std::result::Result<Regex, fancy_regex::Error> {
    RegexBuilder::new(pattern)
        .backtrack_limit(backtrack_limit)
        .build()
}

/// Compile a rule pattern.
///
/// A pattern that is not a valid regex is compiled again as an escaped
/// literal so plain-text rules still match as exact substrings.
pub fn compile_pattern(pattern: &str, backtrack_limit: usize) -> Result<Regex> {
    match build(pattern, backtrack_limit) {
        Ok(re) => Ok(re),
        Err(e) => {
            debug!("regexp compile {:?} failed: {}", pattern, e);
            let escaped = fancy_regex::escape(pattern);
            build(&escaped, backtrack_limit).map_err(|e| ReplacerError::Compile {
                rule: pattern.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Rule configuration plus a lazily compiled pattern.
///
/// The pattern is compiled at most once per instance; reloading the rule
/// set builds new instances.
pub struct ReplaceRule {
    config: RuleConfig,
    backtrack_limit: usize,
    compiled: OnceLock<std::result::Result<Arc<Regex>, String>>,
}

impl ReplaceRule {
    pub fn new(config: RuleConfig) -> Self {
        Self::with_backtrack_limit(config, DEFAULT_BACKTRACK_LIMIT)
    }

    pub fn with_backtrack_limit(config: RuleConfig, backtrack_limit: usize) -> Self {
        Self {
            config,
            backtrack_limit,
            compiled: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Cached pattern, compiling on first use
    pub fn compile(&self) -> Result<Arc<Regex>> {
        let compiled = self.compiled.get_or_init(|| {
            compile_pattern(&self.config.rule, self.backtrack_limit)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        });
        match compiled {
            Ok(re) => Ok(Arc::clone(re)),
            Err(reason) => Err(ReplacerError::Compile {
                rule: self.config.rule.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Replace every match in `text` with the rule's result template.
    /// `None` when nothing was replaced.
    pub(crate) fn substitute(&self, re: &Regex, text: &str) -> Result<Option<String>> {
        substitute(re, &self.config, text)
    }
}

/// Replace every match in `text` with `config.result`, expanding `$1` and
/// `${name}` group references. `None` when nothing was replaced.
pub fn substitute(re: &Regex, config: &RuleConfig, text: &str) -> Result<Option<String>> {
    let replaced = re
        .try_replacen(text, 0, config.result.as_str())
        .map_err(|e| ReplacerError::from_regex(&config.rule, e))?;
    match replaced {
        Cow::Borrowed(_) => Ok(None),
        Cow::Owned(s) => Ok(Some(s)),
    }
}

impl Deref for ReplaceRule {
    type Target = RuleConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl fmt::Debug for ReplaceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaceRule")
            .field("verbose_name", &self.config.verbose_name)
            .field("index", &self.config.index)
            .field("rule", &self.config.rule)
            .finish()
    }
}

impl fmt::Display for ReplaceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.config, f)
    }
}

/// Ordered rule collection
pub type Rules = Vec<Arc<ReplaceRule>>;

/// Stable sort by index, ties keep their relative order
pub fn sort_rules(rules: &mut Rules) {
    rules.sort_by_key(|r| r.index);
}

/// Configurations of a rule collection, in order
pub fn rule_configs(rules: &Rules) -> Vec<RuleConfig> {
    rules.iter().map(|r| r.config.clone()).collect()
}
