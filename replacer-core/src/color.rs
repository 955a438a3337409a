//! Mirror path: coloring, tagging and data extraction. Packets are only
//! matched, never rewritten.

use crate::matcher::MatchResult;
use crate::metrics::ReplacerMetrics;
use crate::panic_message;
use crate::replacer::MitmReplacer;
use crate::rule::ReplaceRule;
use replacer_common::{
    ClientExchange, ColorFlow, ExtractedData, FlowColor, RuleConfig, SOURCE_TYPE_HTTPFLOW,
};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// What the caller knows about the hijacking side of a flow
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Looked up in the matched-rule registry when no rule is given
    pub request_id: Option<String>,
    pub last_matched_rule: Option<RuleConfig>,
}

impl RequestContext {
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            last_matched_rule: None,
        }
    }

    pub fn with_rule(rule: RuleConfig) -> Self {
        Self {
            request_id: None,
            last_matched_rule: Some(rule),
        }
    }
}

/// Colors and tags collected for one flow. Earlier entries take precedence.
#[derive(Debug, Default)]
struct Marks {
    colors: Vec<String>,
    tags: Vec<String>,
}

impl Marks {
    fn add_rule(&mut self, rule: &RuleConfig) {
        if !rule.color.is_empty() {
            self.colors.push(rule.color.clone());
        }
        self.tags.extend(rule.extra_tag.iter().cloned());
    }

    fn prepend_rule(&mut self, rule: &RuleConfig) {
        if !rule.color.is_empty() {
            self.colors.insert(0, rule.color.clone());
        }
        let mut tags = rule.extra_tag.clone();
        tags.append(&mut self.tags);
        self.tags = tags;
    }

    fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.tags.is_empty()
    }

    fn apply(self, flow: &mut dyn ColorFlow) {
        // the first color wins, so it is set last
        for name in unique_colors(&self.colors).iter().rev() {
            match name.parse::<FlowColor>() {
                Ok(color) => flow.set_color(color),
                Err(e) => debug!("{}", e),
            }
        }
        if !self.tags.is_empty() {
            flow.add_tags(&self.tags);
        }
    }
}

/// Colors in first-seen order without repeats
pub fn unique_colors(colors: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(colors.len());
    for color in colors {
        let color = color.trim();
        if !color.is_empty() && !unique.iter().any(|c| c.eq_ignore_ascii_case(color)) {
            unique.push(color.to_string());
        }
    }
    unique
}

fn extracted_data(trace_id: &str, rule: &ReplaceRule, m: &MatchResult) -> ExtractedData {
    ExtractedData {
        source_type: SOURCE_TYPE_HTTPFLOW.to_string(),
        trace_id: trace_id.to_string(),
        regexp: rule.to_string(),
        rule_verbose: rule.verbose_name.clone(),
        data: m.match_result.clone(),
        data_index: m.packet_offset(),
        length: m.len(),
        is_match_request: m.is_match_request,
    }
}

impl MitmReplacer {
    /// Color and tag an HTTP flow with every mirror rule matching its
    /// request or response. Returns one record per reported match.
    ///
    /// Rules recorded under `ctx.request_id` by [`MitmReplacer::hook`] are
    /// consumed: a second call for the same request sees no recorded rule.
    pub fn hook_color(
        &self,
        request: &[u8],
        response: &[u8],
        ctx: &RequestContext,
        flow: &mut dyn ColorFlow,
    ) -> Vec<ExtractedData> {
        let colored = panic::catch_unwind(AssertUnwindSafe(|| {
            self.color_http(request, response, ctx, flow)
        }));
        colored.unwrap_or_else(|payload| {
            error!("colorize failed: {}", panic_message(payload.as_ref()));
            ReplacerMetrics::incr(&self.metrics.recovered_panics);
            Vec::new()
        })
    }

    /// Color and tag a WebSocket frame
    pub fn hook_color_ws(&self, raw: &[u8], flow: &mut dyn ColorFlow) {
        let colored = panic::catch_unwind(AssertUnwindSafe(|| self.color_ws(raw, flow)));
        if let Err(payload) = colored {
            error!("colorize websocket failed: {}", panic_message(payload.as_ref()));
            ReplacerMetrics::incr(&self.metrics.recovered_panics);
        }
    }

    /// Color and tag an exchange made by the engine's own client
    pub fn hook_color_exchange(
        &self,
        exchange: &mut ClientExchange,
        ctx: &RequestContext,
    ) -> Vec<ExtractedData> {
        exchange.ensure_hidden_index();
        let request = exchange.raw_request.clone();
        let response = exchange.raw_response.clone();
        self.hook_color(&request, &response, ctx, exchange)
    }

    fn color_http(
        &self,
        request: &[u8],
        response: &[u8],
        ctx: &RequestContext,
        flow: &mut dyn ColorFlow,
    ) -> Vec<ExtractedData> {
        let snapshot = self.snapshot();
        let url = flow.url().to_string();
        let hidden_index = flow.hidden_index().to_string();

        let mut marks = Marks::default();
        let mut extracted = Vec::new();

        for rule in snapshot.mirror_rules.iter() {
            if !rule.has_direction() || !self.url_filter.is_effective(&rule.effective_url, &url) {
                continue;
            }
            let mut matched = Vec::new();
            if rule.enable_for_request {
                matched.extend(self.mirror_match(rule, request, true));
            }
            if rule.enable_for_response {
                matched.extend(self.mirror_match(rule, response, false));
            }
            if matched.is_empty() {
                continue;
            }
            marks.add_rule(rule.config());
            extracted.extend(matched.iter().map(|m| extracted_data(&hidden_index, rule, m)));
        }

        if let Some(last) = self.last_matched_rule(ctx) {
            marks.prepend_rule(&last);
        }
        if !marks.is_empty() {
            ReplacerMetrics::incr(&self.metrics.colored_flows);
        }
        ReplacerMetrics::add(&self.metrics.extracted_data, extracted.len() as u64);

        marks.apply(flow);
        extracted
    }

    fn color_ws(&self, raw: &[u8], flow: &mut dyn ColorFlow) {
        let snapshot = self.snapshot();
        let mut marks = Marks::default();

        for rule in snapshot.mirror_rules.iter() {
            if !rule.has_direction() {
                continue;
            }
            match rule.match_raw_simple(raw) {
                Ok(true) => marks.add_rule(rule.config()),
                Ok(false) => {}
                Err(e) => error!("match websocket frame failed: {}", e),
            }
        }

        if !marks.is_empty() {
            ReplacerMetrics::incr(&self.metrics.colored_flows);
        }
        marks.apply(flow);
    }

    fn mirror_match(
        &self,
        rule: &ReplaceRule,
        packet: &[u8],
        is_request: bool,
    ) -> Vec<MatchResult> {
        if packet.is_empty() {
            return Vec::new();
        }
        match rule.match_packet(packet, is_request) {
            Ok((_, results)) => results,
            Err(e) if e.is_match_timeout() => {
                warn!("rule {:?} skipped: {}", rule.verbose_name, e);
                ReplacerMetrics::incr(&self.metrics.match_timeouts);
                Vec::new()
            }
            Err(e) => {
                error!("match packet failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Coloring is the last step of a flow, so the registry entry for the
    /// request is released here.
    fn last_matched_rule(&self, ctx: &RequestContext) -> Option<RuleConfig> {
        let recorded = ctx
            .request_id
            .as_deref()
            .and_then(|id| self.registry.take(id))
            .and_then(|mut rules| rules.pop());
        ctx.last_matched_rule.clone().or(recorded)
    }
}
