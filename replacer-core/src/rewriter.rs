//! Packet rewriting: structured header/cookie overrides and pattern
//! substitution.

use crate::cookie::{merge_cookies, overrides_to_cookies, parse_cookie_header, Cookie};
use crate::error::ReplacerError;
use crate::matcher::MatchResult;
use crate::packet::{parse_head, replace_packet_body, split_header_body, split_header_line, CRLF};
use crate::rule::{substitute, ReplaceRule};
use crate::Result;
use fancy_regex::Regex;
use replacer_common::{HeaderOverride, RuleConfig};
use tracing::debug;

impl ReplaceRule {
    /// Match the rule against a packet and rewrite it.
    ///
    /// No match returns the packet unchanged. A request rule with header or
    /// cookie overrides rebuilds the header block; any other rule
    /// substitutes its result template into the enabled regions.
    pub fn match_and_replace_packet(
        &self,
        packet: &[u8],
        is_request: bool,
    ) -> Result<(Vec<MatchResult>, Vec<u8>)> {
        let (info, matched) = self.match_packet(packet, is_request)?;
        if matched.is_empty() {
            return Ok((matched, packet.to_vec()));
        }

        if self.has_structured_overrides() {
            if !is_request {
                return Err(ReplacerError::StructuredReplace(
                    "cannot replace header or cookie in response".to_string(),
                ));
            }
            let head = parse_head(info.header_raw.as_bytes());
            let mut header_raw =
                format!("{} {} {}{}", info.method, info.request_uri, info.proto, CRLF);
            let lines = rebuild_header_lines(self.config(), &head.header_lines, &info.cookies);
            for line in lines {
                header_raw.push_str(&line);
                header_raw.push_str(CRLF);
            }
            header_raw.push_str(CRLF);
            return Ok((matched, replace_packet_body(&header_raw, &info.body_raw)));
        }

        let re = self.compile()?;

        if self.enable_for_header && self.enable_for_body {
            let entire = info.entire();
            let text = String::from_utf8_lossy(&entire);
            let modified = match self.substitute(&re, &text)? {
                Some(replaced) => {
                    let (header, body) = split_header_body(replaced.as_bytes());
                    replace_packet_body(&header, &body)
                }
                None => entire,
            };
            return Ok((matched, modified));
        }

        let mut header_raw = info.header_raw.clone();
        let mut body = info.body_raw.clone();

        if is_request && self.enable_for_uri && !info.request_uri.is_empty() {
            if let Some(uri) = self.substitute(&re, &info.request_uri)? {
                header_raw = header_raw.replacen(&info.request_uri, &uri, 1);
            }
        }
        if self.enable_for_header {
            // the header region includes the start line, so it replaces any
            // URI rewrite above rather than applying on top of it
            if let Some(replaced) = self.substitute(&re, &info.header_raw)? {
                header_raw = replaced;
            }
        }
        if self.enable_for_body {
            let text = String::from_utf8_lossy(&info.body_raw);
            if let Some(replaced) = self.substitute(&re, &text)? {
                body = replaced.into_bytes();
            }
        }

        Ok((matched, replace_packet_body(&header_raw, &body)))
    }
}

/// Rebuild header lines applying header overrides in place, appending the
/// overrides that named no existing header, and folding configured cookies
/// into a single merged `Cookie` header.
fn rebuild_header_lines(
    config: &RuleConfig,
    header_lines: &[String],
    cookies: &[Cookie],
) -> Vec<String> {
    let mut pending: Vec<&HeaderOverride> = config.extra_headers.iter().collect();
    let mut merged_cookies = cookies.to_vec();
    merged_cookies.extend(overrides_to_cookies(&config.extra_cookies));

    let mut lines = Vec::with_capacity(header_lines.len() + pending.len() + 1);
    let mut cookie_line = None;

    for line in header_lines {
        let (key, value) = split_header_line(line);
        if key.eq_ignore_ascii_case("cookie") {
            if cookie_line.is_none() {
                cookie_line = Some(lines.len());
                lines.push(String::new());
            }
            continue;
        }
        match pending.iter().position(|h| h.header.eq_ignore_ascii_case(&key)) {
            Some(idx) => {
                let h = pending.remove(idx);
                lines.push(format!("{}: {}", key, h.value));
            }
            None => lines.push(format!("{}: {}", key, value)),
        }
    }

    for h in pending {
        lines.push(format!("{}: {}", h.header, h.value));
    }

    if !merged_cookies.is_empty() {
        let value = format!("Cookie: {}", merge_cookies(&merged_cookies));
        match cookie_line {
            Some(idx) => lines[idx] = value,
            None => lines.push(value),
        }
    } else if let Some(idx) = cookie_line {
        lines.remove(idx);
    }
    lines
}

/// Apply header/cookie overrides to a merged request header when the rule
/// matches the header or the body. Returns the header and whether it was
/// modified.
pub fn replace_http_header(
    re: &Regex,
    config: &RuleConfig,
    header: &str,
    body: &[u8],
    is_request: bool,
) -> (String, bool) {
    if !is_request || !config.has_structured_overrides() {
        return (header.to_string(), false);
    }
    let matched = re.is_match(header).unwrap_or(false)
        || re.is_match(&String::from_utf8_lossy(body)).unwrap_or(false);
    if !matched {
        return (header.to_string(), false);
    }

    let head = parse_head(header.as_bytes());
    let cookies: Vec<Cookie> = head
        .header_lines
        .iter()
        .map(|line| split_header_line(line))
        .filter(|(key, _)| key.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| parse_cookie_header(&value))
        .collect();

    let mut out = String::with_capacity(header.len() + 64);
    out.push_str(&head.start_line);
    out.push_str(CRLF);
    for line in rebuild_header_lines(config, &head.header_lines, &cookies) {
        out.push_str(&line);
        out.push_str(CRLF);
    }
    out.push_str(CRLF);
    (out, true)
}

/// Substitute the result template into a merged header
pub fn replace_header(re: &Regex, config: &RuleConfig, header: &str) -> (String, bool) {
    match substitute(re, config, header) {
        Ok(Some(replaced)) if !replaced.is_empty() => (replaced, true),
        Ok(_) => (header.to_string(), false),
        Err(e) => {
            debug!("replace header failed: {}", e);
            (header.to_string(), false)
        }
    }
}

/// Substitute the result template into the request URI of a header block
pub fn replace_uri_in_header(
    re: &Regex,
    config: &RuleConfig,
    header: &str,
    is_request: bool,
) -> (String, bool) {
    if !is_request {
        return (header.to_string(), false);
    }
    let mut head = parse_head(header.as_bytes());
    let mut parts: Vec<String> = head.start_line.splitn(3, ' ').map(str::to_string).collect();
    if parts.len() < 2 {
        return (header.to_string(), false);
    }
    match substitute(re, config, &parts[1]) {
        Ok(Some(uri)) => {
            parts[1] = uri;
            head.start_line = parts.join(" ");
            (head.header_raw(), true)
        }
        Ok(None) => (header.to_string(), false),
        Err(e) => {
            debug!("replace uri failed: {}", e);
            (header.to_string(), false)
        }
    }
}

/// Substitute the result template into a body
pub fn replace_body(re: &Regex, config: &RuleConfig, body: &[u8]) -> (Vec<u8>, bool) {
    if body.is_empty() {
        return (Vec::new(), false);
    }
    match substitute(re, config, &String::from_utf8_lossy(body)) {
        Ok(Some(replaced)) => (replaced.into_bytes(), true),
        Ok(None) => (body.to_vec(), false),
        Err(e) => {
            debug!("replace body failed: {}", e);
            (body.to_vec(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::split_packet;
    use crate::rule::compile_pattern;
    use replacer_common::CookieOverride;

    fn rule(pattern: &str, result: &str, configure: impl FnOnce(&mut RuleConfig)) -> ReplaceRule {
        let mut config = RuleConfig::new(pattern, result);
        config.enable_for_request = true;
        config.enable_for_response = true;
        configure(&mut config);
        ReplaceRule::new(config)
    }

    const REQUEST: &[u8] =
        b"POST /login?user=admin HTTP/1.1\r\nHost: example.com\r\n\
          Cookie: sid=1; lang=en\r\nContent-Length: 10\r\n\r\nuser=admin";

    #[test]
    fn test_no_match_returns_input() {
        let r = rule("nomatch", "x", |c| c.enable_for_body = true);
        let (matched, packet) = r.match_and_replace_packet(REQUEST, true).unwrap();
        assert!(matched.is_empty());
        assert_eq!(packet, REQUEST.to_vec());
    }

    #[test]
    fn test_body_substitution_fixes_length() {
        let r = rule("admin", "administrator", |c| c.enable_for_body = true);
        let (matched, packet) = r.match_and_replace_packet(REQUEST, true).unwrap();
        assert_eq!(matched.len(), 1);
        let info = split_packet(&packet);
        assert_eq!(info.body_raw, b"user=administrator");
        assert_eq!(info.header("Content-Length"), Some("18"));
        // URI untouched
        assert_eq!(info.request_uri, "/login?user=admin");
    }

    #[test]
    fn test_uri_substitution() {
        let r = rule(r"user=(\w+)", "user=guest", |c| c.enable_for_uri = true);
        let (_, packet) = r.match_and_replace_packet(REQUEST, true).unwrap();
        let info = split_packet(&packet);
        assert_eq!(info.request_uri, "/login?user=guest");
        assert_eq!(info.body_raw, b"user=admin");
    }

    #[test]
    fn test_entire_substitution() {
        let r = rule("admin", "root", |c| {
            c.enable_for_header = true;
            c.enable_for_body = true;
        });
        let (matched, packet) = r.match_and_replace_packet(REQUEST, true).unwrap();
        assert_eq!(matched.len(), 2);
        let info = split_packet(&packet);
        assert_eq!(info.request_uri, "/login?user=root");
        assert_eq!(info.body_raw, b"user=root");
        assert_eq!(info.header("Content-Length"), Some("9"));
    }

    #[test]
    fn test_structured_headers_and_cookies() {
        let r = rule("admin", "", |c| {
            c.enable_for_body = true;
            c.extra_headers = vec![
                HeaderOverride::new("host", "evil.com"),
                HeaderOverride::new("X-New", "1"),
            ];
            c.extra_cookies = vec![
                CookieOverride::new("sid", "2"),
                CookieOverride::new("debug", "true"),
            ];
        });
        let (_, packet) = r.match_and_replace_packet(REQUEST, true).unwrap();
        let text = String::from_utf8(packet).unwrap();
        assert_eq!(
            text,
            "POST /login?user=admin HTTP/1.1\r\nHost: evil.com\r\n\
             Cookie: sid=2; lang=en; debug=true\r\nContent-Length: 10\r\n\
             X-New: 1\r\n\r\nuser=admin"
        );
    }

    #[test]
    fn test_structured_cookie_added_when_absent() {
        let r = rule("GET", "", |c| {
            c.enable_for_header = true;
            c.extra_cookies = vec![CookieOverride::new("a", "1")];
        });
        let (_, packet) = r
            .match_and_replace_packet(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", true)
            .unwrap();
        assert_eq!(packet, b"GET / HTTP/1.1\r\nHost: x\r\nCookie: a=1\r\n\r\n".to_vec());
    }

    #[test]
    fn test_structured_on_response_fails() {
        let r = rule("OK", "", |c| {
            c.enable_for_header = true;
            c.extra_headers = vec![HeaderOverride::new("X", "1")];
        });
        let err = r
            .match_and_replace_packet(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", false)
            .unwrap_err();
        assert!(matches!(err, ReplacerError::StructuredReplace(_)));
    }

    #[test]
    fn test_replace_http_header() {
        let mut config = RuleConfig::new("secret", "");
        config.extra_headers = vec![HeaderOverride::new("X-Flag", "on")];
        let re = compile_pattern(&config.rule, 10_000).unwrap();
        let header = "GET / HTTP/1.1\r\nHost: a\r\n\r\n";

        let (out, modified) = replace_http_header(&re, &config, header, b"a secret body", true);
        assert!(modified);
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: a\r\nX-Flag: on\r\n\r\n");

        let (out, modified) = replace_http_header(&re, &config, header, b"plain", true);
        assert!(!modified);
        assert_eq!(out, header);

        let (_, modified) = replace_http_header(&re, &config, header, b"secret", false);
        assert!(!modified);
    }

    #[test]
    fn test_replace_primitives() {
        let config = RuleConfig::new(r"v(\d)", "version$1");
        let re = compile_pattern(&config.rule, 10_000).unwrap();

        let (out, ok) = replace_header(&re, &config, "X-V: v1\r\n");
        assert!(ok);
        assert_eq!(out, "X-V: version1\r\n");

        let header = "GET /api/v2 HTTP/1.1\r\nHost: a\r\n\r\n";
        let (out, ok) = replace_uri_in_header(&re, &config, header, true);
        assert!(ok);
        assert_eq!(out, "GET /api/version2 HTTP/1.1\r\nHost: a\r\n\r\n");
        let (_, ok) = replace_uri_in_header(&re, &config, "GET /api/v2 HTTP/1.1\r\n\r\n", false);
        assert!(!ok);

        let (out, ok) = replace_body(&re, &config, b"v3");
        assert!(ok);
        assert_eq!(out, b"version3");
        assert!(!replace_body(&re, &config, b"").1);
    }
}
