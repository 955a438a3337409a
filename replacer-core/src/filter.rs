use crate::rule::compile_pattern;
use dashmap::DashMap;
use fancy_regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Gate that limits a rule to URLs matching its `EffectiveURL` pattern.
/// Compiled patterns are cached by pattern text.
#[derive(Debug)]
pub struct EffectiveUrlFilter {
    backtrack_limit: usize,
    patterns: DashMap<String, Option<Arc<Regex>>>,
}

impl EffectiveUrlFilter {
    /// Create a new EffectiveUrlFilter
    pub fn new(backtrack_limit: usize) -> Self {
        Self {
            backtrack_limit,
            patterns: DashMap::new(),
        }
    }

    /// Check if a rule with the given effective URL pattern applies to `url`
    ///
    /// Logic:
    /// 1. An empty pattern applies everywhere.
    /// 2. A pattern that cannot be compiled or evaluated does not restrict the rule.
    /// 3. Otherwise the rule applies only when the pattern matches.
    pub fn is_effective(&self, pattern: &str, url: &str) -> bool {
        if pattern.is_empty() {
            return true;
        }
        let Some(re) = self.pattern(pattern) else {
            return true;
        };
        match re.is_match(url) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("effective url {:?} failed on {}: {}", pattern, url, e);
                true
            }
        }
    }

    fn pattern(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(cached) = self.patterns.get(pattern) {
            return cached.clone();
        }
        let compiled = match compile_pattern(pattern, self.backtrack_limit) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                debug!("effective url pattern ignored: {}", e);
                None
            }
        };
        self.patterns.insert(pattern.to_string(), compiled.clone());
        compiled
    }

    /// Drop cached patterns
    pub fn clear(&self) {
        self.patterns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_url() {
        let filter = EffectiveUrlFilter::new(10_000);

        // Empty pattern = applies everywhere
        assert!(filter.is_effective("", "http://anything/"));

        // Regex pattern
        assert!(filter.is_effective(r"example\.com/api", "https://example.com/api/v1"));
        assert!(!filter.is_effective(r"example\.com/api", "https://other.com/"));

        // Invalid regex falls back to a literal substring
        assert!(filter.is_effective("a(b", "http://x/a(b"));
        assert!(!filter.is_effective("a(b", "http://x/ab"));
    }
}
