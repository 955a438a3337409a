//! Raw HTTP packet decomposition.
//!
//! Only as much HTTP/1.1 as is needed to find the start line, the header
//! block and the body. Chunked and gzip bodies are decoded so rules see
//! plain text; decode failures keep the encoded body.

use crate::codec::{chunked_decode, gzip_decompress};
use crate::cookie::{parse_cookie_header, parse_set_cookie_header, Cookie};
use crate::error::ReplacerError;
use crate::Result;
use tracing::debug;

pub const CRLF: &str = "\r\n";

/// Decomposed view of one HTTP packet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketInfo {
    /// The packet as given to the decomposer
    pub raw: Vec<u8>,
    pub method: String,
    pub request_uri: String,
    pub proto: String,
    /// Start line and headers, including the terminating blank line
    pub header_raw: String,
    /// Body after transfer/content decoding
    pub body_raw: Vec<u8>,
    /// Header pairs in packet order, duplicates preserved
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<Cookie>,
    pub is_request: bool,
    /// Name of the `Transfer-Encoding: chunked` header, if present
    pub chunked_header: Option<String>,
    /// Name of the `Content-Encoding: gzip` header, if present
    pub gzip_header: Option<String>,
}

impl PacketInfo {
    /// Header block followed by the decoded body
    pub fn entire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_raw.len() + self.body_raw.len());
        out.extend_from_slice(self.header_raw.as_bytes());
        out.extend_from_slice(&self.body_raw);
        out
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Start line and header lines of a packet, and the offset of its body
#[derive(Debug, Default)]
pub(crate) struct RawHead {
    pub start_line: String,
    pub header_lines: Vec<String>,
    pub body_start: usize,
}

impl RawHead {
    /// Re-serialize the head with CRLF line endings
    pub fn header_raw(&self) -> String {
        if self.start_line.is_empty() && self.header_lines.is_empty() {
            return String::new();
        }
        let mut out = String::with_capacity(
            self.start_line.len()
                + self.header_lines.iter().map(|l| l.len() + 2).sum::<usize>()
                + 4,
        );
        out.push_str(&self.start_line);
        out.push_str(CRLF);
        for line in &self.header_lines {
            out.push_str(line);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
        out
    }
}

const MAX_HEADERS: usize = 256;

/// Parse the start line and header lines. Leading blank lines are skipped;
/// the body begins after the first blank line following the start line.
///
/// Well-formed heads are framed by `httparse`. Heads it rejects (no
/// terminator, lines without a colon, non-1.x versions) go through a
/// lenient line scan instead.
pub(crate) fn parse_head(packet: &[u8]) -> RawHead {
    match framed_head_len(packet) {
        Some(len) => {
            let mut head = scan_head(&packet[..len]);
            head.body_start = len;
            head
        }
        None => scan_head(packet),
    }
}

/// Length of a complete head as framed by `httparse`
fn framed_head_len(packet: &[u8]) -> Option<usize> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let start = packet
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(packet.len());
    let status = if packet[start..].starts_with(b"HTTP/") {
        httparse::Response::new(&mut headers).parse(packet)
    } else {
        httparse::Request::new(&mut headers).parse(packet)
    };
    match status {
        Ok(httparse::Status::Complete(len)) => Some(len),
        Ok(httparse::Status::Partial) => None,
        Err(e) => {
            debug!("lenient head parse: {}", e);
            None
        }
    }
}

fn scan_head(packet: &[u8]) -> RawHead {
    let mut head = RawHead::default();
    let mut seen_start = false;
    let mut pos = 0;

    while pos < packet.len() {
        let (line_bytes, next) = match packet[pos..].iter().position(|b| *b == b'\n') {
            Some(i) => (&packet[pos..pos + i], pos + i + 1),
            None => (&packet[pos..], packet.len()),
        };
        pos = next;
        let line_bytes = line_bytes.strip_suffix(b"\r").unwrap_or(line_bytes);
        let line = String::from_utf8_lossy(line_bytes);

        if !seen_start {
            if line.trim().is_empty() {
                continue;
            }
            head.start_line = line.into_owned();
            seen_start = true;
            continue;
        }
        if line.is_empty() {
            break;
        }
        head.header_lines.push(line.into_owned());
    }

    head.body_start = pos.min(packet.len());
    head
}

/// Split a start line into its three tokens.
///
/// For a request that is method / URI / proto; for a response the tokens
/// are proto / status / reason.
pub fn split_start_line(line: &str) -> (String, String, String) {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or("").to_string();
    let second = parts.next().unwrap_or("").to_string();
    let third = parts.next().unwrap_or("").to_string();
    (first, second, third)
}

/// Split a header line into name and value
pub fn split_header_line(line: &str) -> (String, String) {
    match line.split_once(':') {
        Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

/// Split a packet into its header block (with terminating blank line) and body
pub fn split_header_body(packet: &[u8]) -> (String, Vec<u8>) {
    let head = parse_head(packet);
    (head.header_raw(), packet[head.body_start..].to_vec())
}

/// Remove every header line with the given name (case-insensitive)
pub fn delete_header(header_raw: &str, name: &str) -> String {
    let head = parse_head(header_raw.as_bytes());
    let kept = RawHead {
        start_line: head.start_line,
        header_lines: head
            .header_lines
            .into_iter()
            .filter(|line| !split_header_line(line).0.eq_ignore_ascii_case(name))
            .collect(),
        body_start: 0,
    };
    kept.header_raw()
}

/// Join a header block with a new body, fixing the framing headers:
/// `Content-Length` is rewritten in place (or added for a non-empty body)
/// and a chunked `Transfer-Encoding` is dropped.
pub fn replace_packet_body(header_raw: &str, body: &[u8]) -> Vec<u8> {
    let head = parse_head(header_raw.as_bytes());
    let length_line = format!("Content-Length: {}", body.len());
    let mut has_length = false;
    let mut lines = Vec::with_capacity(head.header_lines.len() + 1);

    for line in head.header_lines {
        let (key, value) = split_header_line(&line);
        if key.eq_ignore_ascii_case("content-length") {
            if !has_length {
                lines.push(length_line.clone());
                has_length = true;
            }
            continue;
        }
        if key.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            continue;
        }
        lines.push(line);
    }
    if !has_length && !body.is_empty() {
        lines.push(length_line);
    }

    let rebuilt = RawHead {
        start_line: head.start_line,
        header_lines: lines,
        body_start: 0,
    };
    let mut packet = rebuilt.header_raw().into_bytes();
    packet.extend_from_slice(body);
    packet
}

/// Normalize line endings: bare `\n` becomes `\r\n` and `\r\r\n` collapses
/// to `\r\n`. Applying it twice gives the same bytes as applying it once.
pub fn normalize_line_endings(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + packet.len() / 32);
    for &b in packet {
        if b == b'\n' {
            while out.last() == Some(&b'\r') {
                out.pop();
            }
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(b);
        }
    }
    out
}

/// Repair response framing: decode chunked/gzip bodies and fix `Content-Length`.
pub fn fix_http_response(packet: &[u8]) -> Result<Vec<u8>> {
    let head = parse_head(packet);
    if !head.start_line.starts_with("HTTP/") {
        return Err(ReplacerError::InvalidPacket(format!(
            "not an HTTP response: {:?}",
            head.start_line
        )));
    }
    let info = split_packet(packet);
    Ok(replace_packet_body(&info.header_raw, &info.body_raw))
}

/// Prepare a packet for matching. Responses are repaired first; `None`
/// means the response could not be repaired and the input should be used
/// unchanged.
pub fn fix_packet(packet: &[u8], is_request: bool) -> Option<Vec<u8>> {
    if is_request {
        return Some(normalize_line_endings(packet));
    }
    match fix_http_response(packet) {
        Ok(fixed) => Some(normalize_line_endings(&fixed)),
        Err(e) => {
            debug!("fix http response failed: {}", e);
            None
        }
    }
}

/// Decompose a packet into start line, headers and decoded body
pub fn split_packet(raw: &[u8]) -> PacketInfo {
    let head = parse_head(raw);
    let (method, request_uri, proto) = split_start_line(&head.start_line);
    let mut info = PacketInfo {
        raw: raw.to_vec(),
        method,
        request_uri,
        proto,
        ..Default::default()
    };

    for line in &head.header_lines {
        let (key, value) = split_header_line(line);
        match key.to_ascii_lowercase().as_str() {
            "transfer-encoding" if value.to_ascii_lowercase().contains("chunked") => {
                info.chunked_header = Some(key.clone());
            }
            "content-encoding" if value == "gzip" => {
                info.gzip_header = Some(key.clone());
            }
            "cookie" => info.cookies.extend(parse_cookie_header(&value)),
            "set-cookie" => info.cookies.extend(parse_set_cookie_header(&value)),
            _ => {}
        }
        info.headers.push((key, value));
    }

    let mut header_raw = head.header_raw();
    let mut body = raw[head.body_start..].to_vec();

    if let Some(name) = &info.chunked_header {
        match chunked_decode(&body) {
            Ok(decoded) => {
                body = decoded;
                header_raw = delete_header(&header_raw, name);
            }
            Err(e) => debug!("keeping chunked body as-is: {}", e),
        }
    }
    if let Some(name) = &info.gzip_header {
        match gzip_decompress(&body) {
            Ok(decoded) => {
                body = decoded;
                header_raw = delete_header(&header_raw, name);
            }
            Err(e) => debug!("keeping gzip body as-is: {}", e),
        }
    }

    info.header_raw = header_raw;
    info.body_raw = body;
    info.is_request = info.proto.starts_with("HTTP");
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{chunked_encode, gzip_compress};

    #[test]
    fn test_split_request() {
        let raw = b"POST /api?q=1 HTTP/1.1\r\nHost: example.com\r\n\
            Cookie: a=1; b=2\r\nContent-Length: 3\r\n\r\nfoo";
        let info = split_packet(raw);
        assert!(info.is_request);
        assert_eq!(info.method, "POST");
        assert_eq!(info.request_uri, "/api?q=1");
        assert_eq!(info.proto, "HTTP/1.1");
        assert_eq!(info.body_raw, b"foo");
        assert_eq!(info.header_raw.len() + 3, raw.len());
        assert_eq!(info.header("host"), Some("example.com"));
        assert_eq!(info.cookies, vec![Cookie::new("a", "1"), Cookie::new("b", "2")]);
        assert_eq!(info.entire(), raw.to_vec());
    }

    #[test]
    fn test_split_response_is_not_request() {
        let info = split_packet(b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=9; Path=/\r\n\r\nhi");
        assert!(!info.is_request);
        assert_eq!(info.method, "HTTP/1.1");
        assert_eq!(info.cookies, vec![Cookie::new("sid", "9")]);
    }

    #[test]
    fn test_duplicate_headers_preserved() {
        let info = split_packet(b"GET / HTTP/1.1\r\nX-A: 1\r\nX-A: 2\r\n\r\n");
        assert_eq!(
            info.headers,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("X-A".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_chunked_body_decoded_and_header_stripped() {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: Chunked\r\n\r\n".to_vec();
        raw.extend(chunked_encode(b"hello"));
        let info = split_packet(&raw);
        assert_eq!(info.body_raw, b"hello");
        assert_eq!(info.chunked_header.as_deref(), Some("Transfer-Encoding"));
        assert!(!info.header_raw.contains("Transfer-Encoding"));
    }

    #[test]
    fn test_gzip_strips_its_own_header() {
        let mut raw =
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nX-Keep: 1\r\n\r\n".to_vec();
        raw.extend(gzip_compress(b"secret").unwrap());
        let info = split_packet(&raw);
        assert_eq!(info.body_raw, b"secret");
        assert!(!info.header_raw.contains("Content-Encoding"));
        assert!(info.header_raw.contains("X-Keep: 1"));
    }

    #[test]
    fn test_bad_gzip_keeps_body_and_header() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\nnot-gzip";
        let info = split_packet(raw);
        assert_eq!(info.body_raw, b"not-gzip");
        assert!(info.header_raw.contains("Content-Encoding: gzip"));
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\r\nc\r\r\nd"), b"a\r\nb\r\nc\r\nd");
        let once = normalize_line_endings(b"GET / HTTP/1.1\nHost: x\n\n");
        assert_eq!(once, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(normalize_line_endings(&once), once);
    }

    #[test]
    fn test_replace_packet_body_fixes_length() {
        let header = "POST / HTTP/1.1\r\nContent-Length: 3\r\nHost: x\r\n\r\n";
        let packet = replace_packet_body(header, b"hello");
        assert_eq!(
            packet,
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nHost: x\r\n\r\nhello".to_vec()
        );

        let packet = replace_packet_body("GET / HTTP/1.1\r\nHost: x\r\n\r\n", b"");
        assert_eq!(packet, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    }

    #[test]
    fn test_fix_http_response() {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend(chunked_encode(b"abc"));
        let fixed = fix_http_response(&raw).unwrap();
        assert_eq!(fixed, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc".to_vec());
        assert!(fix_http_response(b"GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(fix_packet(b"garbage", false).is_none());
    }

    #[test]
    fn test_delete_header() {
        let header = "GET / HTTP/1.1\r\nA: 1\r\nb: 2\r\nB: 3\r\n\r\n";
        assert_eq!(delete_header(header, "B"), "GET / HTTP/1.1\r\nA: 1\r\n\r\n");
    }

    #[test]
    fn test_parse_head_well_formed() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\nX-Empty:\r\n\r\nbody";
        assert_eq!(framed_head_len(raw), Some(raw.len() - 4));

        let head = parse_head(raw);
        assert_eq!(head.start_line, "GET /a HTTP/1.1");
        assert_eq!(head.header_lines, vec!["Host: x", "X-Empty:"]);
        assert_eq!(&raw[head.body_start..], b"body");
    }

    #[test]
    fn test_parse_head_lenient_fallback() {
        // no colon on the second header line
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\nbroken line\r\n\r\nbody";
        assert_eq!(framed_head_len(raw), None);
        let head = parse_head(raw);
        assert_eq!(head.header_lines, vec!["Host: x", "broken line"]);
        assert_eq!(&raw[head.body_start..], b"body");

        // no terminating blank line
        let raw = b"HTTP/1.1 200 OK\r\nServer: y";
        assert_eq!(framed_head_len(raw), None);
        let head = parse_head(raw);
        assert_eq!(head.start_line, "HTTP/1.1 200 OK");
        assert_eq!(head.header_lines, vec!["Server: y"]);
        assert_eq!(head.body_start, raw.len());

        // non 1.x protocol
        let head = parse_head(b"HTTP/2 204\r\nA: 1\r\n\r\n");
        assert_eq!(head.start_line, "HTTP/2 204");
        assert_eq!(head.header_lines, vec!["A: 1"]);
    }

    #[test]
    fn test_empty_packet() {
        let info = split_packet(b"");
        assert!(info.header_raw.is_empty());
        assert!(info.body_raw.is_empty());
    }
}
