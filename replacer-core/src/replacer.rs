//! Rule set manager: owns the rule snapshot shared by every hook call.

use crate::config::ReplacerConfig;
use crate::filter::EffectiveUrlFilter;
use crate::metrics::ReplacerMetrics;
use crate::registry::MatchedRuleRegistry;
use crate::repeat::{HttpRepeatSender, RepeatSender};
use crate::rewriter;
use crate::rule::{compile_pattern, rule_configs, sort_rules, ReplaceRule, Rules};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use fancy_regex::Regex;
use replacer_common::{ClientExchange, RuleConfig};
use std::fmt;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Persistence hook called with the full rule list after `set_rules`/`clear_rules`
pub type AutoSaveCallback = Arc<dyn Fn(&[RuleConfig]) + Send + Sync>;

/// Receives exchanges produced by extra repeats
pub type RepeatSink = Arc<dyn Fn(ClientExchange) + Send + Sync>;

/// Rule collections built from one load
#[derive(Debug, Default)]
pub struct RuleSetSnapshot {
    pub all_rules: Rules,
    pub enabled_rules: Rules,
    pub hijacking_rules: Rules,
    pub mirror_rules: Rules,
}

impl RuleSetSnapshot {
    pub fn build(configs: Vec<RuleConfig>, backtrack_limit: usize) -> Self {
        let mut all_rules: Rules = configs
            .into_iter()
            .map(|c| Arc::new(ReplaceRule::with_backtrack_limit(c, backtrack_limit)))
            .collect();
        sort_rules(&mut all_rules);

        let enabled_rules: Rules = all_rules.iter().filter(|r| is_enabled(r)).cloned().collect();
        // partition keeps the sorted order
        let (mirror_rules, hijacking_rules): (Rules, Rules) =
            enabled_rules.iter().cloned().partition(|r| r.no_replace);

        Self {
            all_rules,
            enabled_rules,
            hijacking_rules,
            mirror_rules,
        }
    }
}

fn is_enabled(rule: &ReplaceRule) -> bool {
    if rule.rule.is_empty() || rule.disabled {
        return false;
    }
    match rule.compile() {
        Ok(_) => true,
        Err(e) => {
            warn!("rule {:?} excluded: {}", rule.verbose_name, e);
            false
        }
    }
}

/// Parse a persisted JSON rule array; malformed input loads no rules
pub fn rules_from_json(json: &str) -> Vec<RuleConfig> {
    match serde_json::from_str::<Option<Vec<RuleConfig>>>(json) {
        Ok(rules) => rules.unwrap_or_default(),
        Err(e) => {
            warn!("unmarshal mitm replacer rules failed: {}", e);
            Vec::new()
        }
    }
}

/// MITM content replacer.
///
/// Cloning is cheap and clones share the rule set, caches, metrics and
/// in-flight repeat tasks.
#[derive(Clone)]
pub struct MitmReplacer {
    pub(crate) config: Arc<ReplacerConfig>,
    snapshot: Arc<ArcSwap<RuleSetSnapshot>>,
    regexp_cache: Arc<DashMap<String, Option<Arc<Regex>>>>,
    pub(crate) url_filter: Arc<EffectiveUrlFilter>,
    pub(crate) registry: Arc<MatchedRuleRegistry>,
    pub(crate) metrics: Arc<ReplacerMetrics>,
    pub(crate) tasks: TaskTracker,
    pub(crate) repeat_sender: Arc<dyn RepeatSender>,
    pub(crate) repeat_sink: Option<RepeatSink>,
    auto_save: Option<AutoSaveCallback>,
}

impl fmt::Debug for MitmReplacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("MitmReplacer")
            .field("config", &self.config)
            .field("rules", &snapshot.all_rules.len())
            .field("hijacking_rules", &snapshot.hijacking_rules.len())
            .field("mirror_rules", &snapshot.mirror_rules.len())
            .field("pending_repeats", &self.tasks.len())
            .finish()
    }
}

impl Default for MitmReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl MitmReplacer {
    pub fn new() -> Self {
        Self::with_config(ReplacerConfig::default())
    }

    pub fn with_config(config: ReplacerConfig) -> Self {
        let tasks = TaskTracker::new();
        // a closed tracker still accepts tasks; wait() then resolves
        // whenever nothing is in flight
        tasks.close();

        Self {
            url_filter: Arc::new(EffectiveUrlFilter::new(config.backtrack_limit)),
            config: Arc::new(config),
            snapshot: Arc::new(ArcSwap::from_pointee(RuleSetSnapshot::default())),
            regexp_cache: Arc::new(DashMap::new()),
            registry: Arc::new(MatchedRuleRegistry::new()),
            metrics: Arc::new(ReplacerMetrics::default()),
            tasks,
            repeat_sender: Arc::new(HttpRepeatSender::new()),
            repeat_sink: None,
            auto_save: None,
        }
    }

    /// Build a replacer and load the given rules
    pub fn with_rules(configs: Vec<RuleConfig>) -> Self {
        let replacer = Self::new();
        replacer.load_rules(configs);
        replacer
    }

    /// Build a replacer from a persisted JSON rule array
    pub fn from_json(json: &str) -> Self {
        Self::with_rules(rules_from_json(json))
    }

    pub fn with_auto_save(
        mut self,
        callback: impl Fn(&[RuleConfig]) + Send + Sync + 'static,
    ) -> Self {
        self.auto_save = Some(Arc::new(callback));
        self
    }

    pub fn with_repeat_sender(mut self, sender: impl RepeatSender) -> Self {
        self.repeat_sender = Arc::new(sender);
        self
    }

    pub fn with_repeat_sink(
        mut self,
        sink: impl Fn(ClientExchange) + Send + Sync + 'static,
    ) -> Self {
        self.repeat_sink = Some(Arc::new(sink));
        self
    }

    /// Replace the rule set. Readers see either the old or the new set.
    pub fn load_rules(&self, configs: Vec<RuleConfig>) {
        let snapshot = RuleSetSnapshot::build(configs, self.config.backtrack_limit);
        debug!(
            "loaded {} mitm replacer rules: {} hijacking, {} mirror",
            snapshot.all_rules.len(),
            snapshot.hijacking_rules.len(),
            snapshot.mirror_rules.len()
        );
        self.regexp_cache.clear();
        self.url_filter.clear();
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Load rules and hand the new rule list to the auto-save callback
    pub fn set_rules(&self, configs: Vec<RuleConfig>) {
        self.load_rules(configs);
        if let Some(save) = &self.auto_save {
            save(self.rules().as_slice());
        }
    }

    pub fn clear_rules(&self) {
        self.load_rules(Vec::new());
        if let Some(save) = &self.auto_save {
            save(Vec::new().as_slice());
        }
        info!("mitm replacer rules cleared");
    }

    /// Current rule set
    pub fn snapshot(&self) -> Arc<RuleSetSnapshot> {
        self.snapshot.load_full()
    }

    pub fn rules(&self) -> Vec<RuleConfig> {
        rule_configs(&self.snapshot.load().all_rules)
    }

    pub fn enabled_rules(&self) -> Vec<RuleConfig> {
        rule_configs(&self.snapshot.load().enabled_rules)
    }

    pub fn hijacking_rules(&self) -> Vec<RuleConfig> {
        rule_configs(&self.snapshot.load().hijacking_rules)
    }

    pub fn mirror_rules(&self) -> Vec<RuleConfig> {
        rule_configs(&self.snapshot.load().mirror_rules)
    }

    pub fn have_rules(&self) -> bool {
        !self.snapshot.load().enabled_rules.is_empty()
    }

    pub fn have_hijacking_rules(&self) -> bool {
        !self.snapshot.load().hijacking_rules.is_empty()
    }

    pub fn config(&self) -> &ReplacerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ReplacerMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &MatchedRuleRegistry {
        &self.registry
    }

    /// Compiled pattern for a rule configuration, cached by pattern text.
    /// Failures are cached as `None`.
    pub fn get_rule(&self, config: &RuleConfig) -> Option<Arc<Regex>> {
        if let Some(cached) = self.regexp_cache.get(&config.rule) {
            return cached.clone();
        }
        let compiled = match compile_pattern(&config.rule, self.config.backtrack_limit) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                warn!("rule {:?} unavailable: {}", config.verbose_name, e);
                None
            }
        };
        self.regexp_cache.insert(config.rule.clone(), compiled.clone());
        compiled
    }

    pub fn replace_http_header(
        &self,
        rule: &RuleConfig,
        header: &str,
        body: &[u8],
        is_request: bool,
    ) -> (String, bool) {
        match self.get_rule(rule) {
            Some(re) => rewriter::replace_http_header(&re, rule, header, body, is_request),
            None => (header.to_string(), false),
        }
    }

    pub fn replace_header(&self, rule: &RuleConfig, header: &str) -> (String, bool) {
        match self.get_rule(rule) {
            Some(re) => rewriter::replace_header(&re, rule, header),
            None => (header.to_string(), false),
        }
    }

    pub fn replace_uri_in_header(
        &self,
        rule: &RuleConfig,
        header: &str,
        is_request: bool,
    ) -> (String, bool) {
        match self.get_rule(rule) {
            Some(re) => rewriter::replace_uri_in_header(&re, rule, header, is_request),
            None => (header.to_string(), false),
        }
    }

    pub fn replace_body(&self, rule: &RuleConfig, body: &[u8]) -> (Vec<u8>, bool) {
        match self.get_rule(rule) {
            Some(re) => rewriter::replace_body(&re, rule, body),
            None => (body.to_vec(), false),
        }
    }

    /// Wait for every in-flight extra repeat to finish
    pub async fn wait_tasks(&self) {
        self.tasks.wait().await;
    }
}
