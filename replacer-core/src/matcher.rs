//! Region-aware rule matching over decomposed packets.

use crate::error::ReplacerError;
use crate::packet::{fix_packet, split_packet, PacketInfo};
use crate::rule::ReplaceRule;
use crate::Result;
use fancy_regex::{Captures, Regex};
use std::sync::Arc;

/// The region a set of matches was found in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchMetaInfo {
    /// Region text the positions refer to
    pub raw: Vec<u8>,
    /// Offset of the region inside the whole packet
    pub offset: usize,
}

/// One match of a rule inside a packet region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Byte range of the whole match inside the region
    pub start: usize,
    pub end: usize,
    pub is_match_request: bool,
    /// Reported text: the full match or the selected capture groups
    pub match_result: String,
    pub meta_info: Arc<MatchMetaInfo>,
}

impl MatchResult {
    /// Start of the match inside the whole packet
    pub fn packet_offset(&self) -> usize {
        self.meta_info.offset + self.start
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl ReplaceRule {
    /// Whether the pattern matches anywhere in `raw`
    pub fn match_raw_simple(&self, raw: &[u8]) -> Result<bool> {
        let re = self.compile()?;
        re.is_match(&String::from_utf8_lossy(raw))
            .map_err(|e| ReplacerError::from_regex(&self.rule, e))
    }

    /// Match inside the regions selected by the rule's flags.
    ///
    /// A rule not enabled for the packet's direction matches nothing.
    /// With both header and body enabled the whole packet is one region.
    /// The URI is matched on requests when enabled and the header is not,
    /// since the header region already contains it.
    pub fn match_by_packet_info(&self, info: &PacketInfo) -> Result<Vec<MatchResult>> {
        let re = self.compile()?;
        let mut results = Vec::new();

        if (info.is_request && !self.enable_for_request)
            || (!info.is_request && !self.enable_for_response)
        {
            return Ok(results);
        }

        if self.enable_for_header && self.enable_for_body {
            let entire = info.entire();
            self.find_all(&re, &entire, 0, info.is_request, &mut results)?;
            return Ok(results);
        }

        if info.is_request && self.enable_for_uri && !self.enable_for_header {
            let offset = info.method.len() + 1;
            self.find_all(&re, info.request_uri.as_bytes(), offset, true, &mut results)?;
        }
        if self.enable_for_header {
            self.find_all(&re, info.header_raw.as_bytes(), 0, info.is_request, &mut results)?;
        }
        if self.enable_for_body {
            let offset = info.header_raw.len();
            self.find_all(&re, &info.body_raw, offset, info.is_request, &mut results)?;
        }
        Ok(results)
    }

    /// Match against a flow's text as a single region
    pub fn match_by_http_flow(&self, text: &str) -> Result<Vec<MatchResult>> {
        let re = self.compile()?;
        let mut results = Vec::new();
        self.find_all(&re, text.as_bytes(), 0, false, &mut results)?;
        Ok(results)
    }

    /// Repair, decompose and match a packet
    pub fn match_packet(
        &self,
        packet: &[u8],
        is_request: bool,
    ) -> Result<(PacketInfo, Vec<MatchResult>)> {
        let fixed = fix_packet(packet, is_request);
        let mut info = split_packet(fixed.as_deref().unwrap_or(packet));
        info.is_request = is_request;
        let results = self.match_by_packet_info(&info)?;
        Ok((info, results))
    }

    fn find_all(
        &self,
        re: &Regex,
        region: &[u8],
        offset: usize,
        is_request: bool,
        results: &mut Vec<MatchResult>,
    ) -> Result<()> {
        let text = String::from_utf8_lossy(region);
        let meta = Arc::new(MatchMetaInfo {
            raw: text.as_bytes().to_vec(),
            offset,
        });

        for caps in re.captures_iter(&text) {
            let caps = caps.map_err(|e| ReplacerError::from_regex(&self.rule, e))?;
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let reported = self.extract(&caps, whole.as_str());
            if reported.is_empty() {
                continue;
            }
            results.push(MatchResult {
                start: whole.start(),
                end: whole.end(),
                is_match_request: is_request,
                match_result: reported,
                meta_info: Arc::clone(&meta),
            });
        }
        Ok(())
    }

    /// Text reported for one match: the full match when the pattern has no
    /// capture groups, otherwise group 1 or the configured groups joined by
    /// ", ".
    fn extract(&self, caps: &Captures<'_>, whole: &str) -> String {
        if caps.len() <= 1 {
            return whole.to_string();
        }
        if self.regexp_groups.is_empty() {
            return caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        }
        self.regexp_groups
            .iter()
            .filter_map(|i| usize::try_from(*i).ok())
            .filter_map(|i| caps.get(i))
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
