//! Hijacking path: ordered, cumulative rewriting of one packet.

use crate::metrics::ReplacerMetrics;
use crate::packet::{fix_http_response, split_packet};
use crate::repeat::RepeatRequest;
use crate::replacer::MitmReplacer;
use crate::panic_message;
use futures::FutureExt;
use replacer_common::RuleConfig;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Per-call options for [`MitmReplacer::hook`]
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// Scheme used when the request is resent
    pub https: bool,
    /// Records matched rules in the registry under this id
    pub request_id: Option<String>,
}

impl HookOptions {
    pub fn https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Result of running the hijacking rules over a packet
#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    /// Rules that matched, in application order
    pub matched_rules: Vec<RuleConfig>,
    /// Bytes to forward
    pub packet: Vec<u8>,
    /// The exchange should be dropped
    pub drop: bool,
}

impl HookOutcome {
    fn unchanged(packet: &[u8]) -> Self {
        Self {
            matched_rules: Vec::new(),
            packet: packet.to_vec(),
            drop: false,
        }
    }
}

impl MitmReplacer {
    /// Apply the hijacking rules in index order, each to the output of the
    /// previous one.
    ///
    /// When a matched request rule asks for an extra repeat, the rewritten
    /// request is resent in the background and the original packet is
    /// returned.
    ///
    /// The resend is spawned on the current Tokio runtime. Called outside a
    /// runtime, the resend is lost: it is logged, counted in
    /// `repeats_failed`, and the original packet is still returned.
    pub fn hook(
        &self,
        is_request: bool,
        is_response: bool,
        url: &str,
        origin: &[u8],
        opts: &HookOptions,
    ) -> HookOutcome {
        let snapshot = self.snapshot();
        if snapshot.hijacking_rules.is_empty() {
            return HookOutcome::unchanged(origin);
        }
        ReplacerMetrics::incr(&self.metrics.hooked_packets);

        let mut modified = if is_response {
            match fix_http_response(origin) {
                Ok(fixed) => fixed,
                Err(e) => {
                    debug!("fix http response packet failed: {}", e);
                    return HookOutcome::unchanged(origin);
                }
            }
        } else {
            origin.to_vec()
        };

        let info = split_packet(&modified);
        if info.header_raw.is_empty() && info.body_raw.is_empty() {
            return HookOutcome::unchanged(origin);
        }

        let mut matched_rules = Vec::new();
        let mut drop = false;
        let mut repeat_rule: Option<RuleConfig> = None;

        for rule in snapshot.hijacking_rules.iter() {
            if rule.no_replace {
                continue;
            }
            let direction_matches = (is_request && rule.enable_for_request)
                || (is_response && rule.enable_for_response);
            if !direction_matches && !rule.enable_for_uri {
                continue;
            }
            if !self.url_filter.is_effective(&rule.effective_url, url) {
                continue;
            }

            let matched = match rule.match_and_replace_packet(&modified, is_request) {
                Ok((matched, packet)) => {
                    modified = packet;
                    matched
                }
                Err(e) if e.is_match_timeout() => {
                    warn!("rule {:?} skipped: {}", rule.verbose_name, e);
                    ReplacerMetrics::incr(&self.metrics.match_timeouts);
                    continue;
                }
                Err(e) => {
                    error!("match and replace packet failed: {}", e);
                    ReplacerMetrics::incr(&self.metrics.skipped_rules);
                    continue;
                }
            };
            if matched.is_empty() {
                continue;
            }

            matched_rules.push(rule.config().clone());
            if rule.drop {
                drop = true;
            }
            if rule.extra_repeat && is_request {
                repeat_rule = Some(rule.config().clone());
            }
        }

        if matched_rules.is_empty() {
            return HookOutcome::unchanged(origin);
        }
        ReplacerMetrics::add(&self.metrics.matched_rules, matched_rules.len() as u64);
        if drop {
            ReplacerMetrics::incr(&self.metrics.dropped_exchanges);
        }
        if let Some(request_id) = &opts.request_id {
            self.registry.record(request_id, &matched_rules);
        }

        if let Some(rule) = repeat_rule {
            self.spawn_repeat(&rule, modified, opts.https);
            return HookOutcome {
                matched_rules,
                packet: origin.to_vec(),
                drop,
            };
        }

        HookOutcome {
            matched_rules,
            packet: modified,
            drop,
        }
    }

    /// Request for resending `packet` on behalf of `rule`
    pub fn repeat_request(&self, rule: &RuleConfig, packet: Vec<u8>, https: bool) -> RepeatRequest {
        let repeat = &self.config.repeat;
        let mut tags: Vec<String> = if rule.extra_tag.is_empty() {
            vec![repeat.tag_prefix.clone()]
        } else {
            rule.extra_tag
                .iter()
                .map(|tag| format!("{}{}", repeat.tag_prefix, tag))
                .collect()
        };
        if !rule.color.is_empty() {
            tags.push(format!("{}{}", self.config.color_tag_prefix, rule.color));
        }

        RepeatRequest {
            packet,
            https,
            timeout: repeat.timeout(),
            redirect_times: repeat.redirect_times,
            source: repeat.source.clone(),
            tags,
        }
    }

    fn spawn_repeat(&self, rule: &RuleConfig, packet: Vec<u8>, https: bool) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("extra repeat skipped, no async runtime: {}", e);
                ReplacerMetrics::incr(&self.metrics.repeats_failed);
                return;
            }
        };

        let request = self.repeat_request(rule, packet, https);
        let this = self.clone();
        let task = async move {
            info!("auto (extra) repeat from mitm");
            match this.repeat_sender.send(request).await {
                Ok(mut exchange) => {
                    ReplacerMetrics::incr(&this.metrics.repeats_sent);
                    this.hook_color_exchange(&mut exchange, &Default::default());
                    if let Some(sink) = &this.repeat_sink {
                        sink(exchange);
                    }
                }
                Err(e) => {
                    error!("extra repeat failed: {}", e);
                    ReplacerMetrics::incr(&this.metrics.repeats_failed);
                }
            }
        };

        let metrics = self.metrics.clone();
        self.tasks.spawn_on(
            async move {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!("extra repeat panic: {}", panic_message(panic.as_ref()));
                    ReplacerMetrics::incr(&metrics.recovered_panics);
                }
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, result: &str, configure: impl FnOnce(&mut RuleConfig)) -> RuleConfig {
        let mut config = RuleConfig::new(pattern, result);
        config.enable_for_request = true;
        config.enable_for_body = true;
        configure(&mut config);
        config
    }

    const REQUEST: &[u8] = b"POST /a HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nfoo";

    #[test]
    fn test_no_rules_is_identity() {
        let replacer = MitmReplacer::new();
        let outcome = replacer.hook(
            true,
            false,
            "http://example.com/a",
            REQUEST,
            &HookOptions::default(),
        );
        assert_eq!(outcome, HookOutcome::unchanged(REQUEST));
    }

    #[test]
    fn test_body_rewrite() {
        let replacer = MitmReplacer::with_rules(vec![rule("foo", "bar", |_| {})]);
        let outcome = replacer.hook(
            true,
            false,
            "http://example.com/a",
            REQUEST,
            &HookOptions::default(),
        );
        assert_eq!(outcome.matched_rules.len(), 1);
        assert!(!outcome.drop);
        assert_eq!(
            outcome.packet,
            b"POST /a HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nbar".to_vec()
        );
    }

    #[test]
    fn test_unmatched_response_is_untouched() {
        let replacer =
            MitmReplacer::with_rules(vec![rule("nomatch", "", |c| c.enable_for_response = true)]);
        let response = b"HTTP/1.1 200 OK\nContent-Length: 2\n\nhi";
        let outcome = replacer.hook(false, true, "", response, &HookOptions::default());
        assert_eq!(outcome.packet, response.to_vec());
    }

    #[test]
    fn test_invalid_response_is_untouched() {
        let replacer =
            MitmReplacer::with_rules(vec![rule("hi", "", |c| c.enable_for_response = true)]);
        let outcome = replacer.hook(false, true, "", b"garbage hi", &HookOptions::default());
        assert_eq!(outcome, HookOutcome::unchanged(b"garbage hi"));
    }

    #[test]
    fn test_repeat_request_tags() {
        let replacer = MitmReplacer::new();
        let plain = rule("foo", "", |_| {});
        let request = replacer.repeat_request(&plain, REQUEST.to_vec(), false);
        assert_eq!(request.tags, vec!["[repeat]"]);
        assert_eq!(request.redirect_times, 0);
        assert_eq!(request.source, "mitm");

        let tagged = rule("foo", "", |c| {
            c.extra_tag = vec!["a".to_string(), "b".to_string()];
            c.color = "red".to_string();
        });
        let request = replacer.repeat_request(&tagged, REQUEST.to_vec(), true);
        assert_eq!(request.tags, vec!["[repeat]a", "[repeat]b", "COLOR_red"]);
        assert!(request.https);
    }

    #[test]
    fn test_repeat_without_runtime_returns_original() {
        let replacer =
            MitmReplacer::with_rules(vec![rule("foo", "bar", |c| c.extra_repeat = true)]);
        let outcome = replacer.hook(true, false, "", REQUEST, &HookOptions::default());
        assert_eq!(outcome.packet, REQUEST.to_vec());
        assert_eq!(outcome.matched_rules.len(), 1);
        assert_eq!(replacer.metrics().snapshot().repeat.failed, 1);
        assert_eq!(replacer.metrics().snapshot().repeat.sent, 0);
    }
}
