use dashmap::DashMap;
use replacer_common::RuleConfig;
use tracing::debug;

/// Hijacking rules matched per request, so the mirror path can find the
/// last matched rule for a flow.
#[derive(Debug, Default)]
pub struct MatchedRuleRegistry {
    /// Maps Request ID -> rules matched so far, in match order
    matched: DashMap<String, Vec<RuleConfig>>,
}

impl MatchedRuleRegistry {
    pub fn new() -> Self {
        Self {
            matched: DashMap::new(),
        }
    }

    /// Append rules matched by one hook call
    pub fn record(&self, request_id: &str, rules: &[RuleConfig]) {
        if rules.is_empty() {
            return;
        }
        self.matched
            .entry(request_id.to_string())
            .or_default()
            .extend(rules.iter().cloned());
    }

    /// The most recently matched rule for a request
    pub fn last_matched(&self, request_id: &str) -> Option<RuleConfig> {
        self.matched
            .get(request_id)
            .and_then(|rules| rules.last().cloned())
    }

    /// Forget a request once its flow is complete
    pub fn take(&self, request_id: &str) -> Option<Vec<RuleConfig>> {
        let removed = self.matched.remove(request_id).map(|(_, rules)| rules);
        if removed.is_some() {
            debug!("Released matched rules for {}", request_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}
