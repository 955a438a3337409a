//! Extra repeat: resending a rewritten request on the side.

use crate::error::ReplacerError;
use crate::packet::{parse_head, split_header_line, split_packet, PacketInfo, CRLF};
use crate::Result;
use async_trait::async_trait;
use replacer_common::ClientExchange;
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Headers the HTTP client derives itself
const CLIENT_MANAGED_HEADERS: &[&str] =
    &["host", "content-length", "transfer-encoding", "connection"];

/// A request to resend
#[derive(Debug, Clone)]
pub struct RepeatRequest {
    /// Raw request bytes, after rewriting
    pub packet: Vec<u8>,
    pub https: bool,
    pub timeout: Duration,
    /// Redirects to follow; 0 follows none
    pub redirect_times: usize,
    pub source: String,
    pub tags: Vec<String>,
}

impl RepeatRequest {
    /// Absolute URL the packet targets
    pub fn target_url(&self) -> Result<Url> {
        target_url(&split_packet(&self.packet), self.https)
    }
}

fn target_url(info: &PacketInfo, https: bool) -> Result<Url> {
    let uri = info.request_uri.as_str();
    let url = if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        let host = info
            .header("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ReplacerError::InvalidPacket("request has no Host header".to_string()))?;
        let scheme = if https { "https" } else { "http" };
        let path = if uri.starts_with('/') { uri } else { "/" };
        format!("{}://{}{}", scheme, host, path)
    };
    Url::parse(&url).map_err(|e| ReplacerError::InvalidPacket(format!("bad url {:?}: {}", url, e)))
}

/// Sends repeat requests on behalf of the replacer
#[async_trait]
pub trait RepeatSender: Send + Sync + 'static {
    async fn send(&self, request: RepeatRequest) -> Result<ClientExchange>;
}

/// Default sender over `reqwest`
#[derive(Debug, Clone, Default)]
pub struct HttpRepeatSender;

impl HttpRepeatSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RepeatSender for HttpRepeatSender {
    async fn send(&self, request: RepeatRequest) -> Result<ClientExchange> {
        let info = split_packet(&request.packet);
        let url = target_url(&info, request.https)?;

        let policy = if request.redirect_times == 0 {
            Policy::none()
        } else {
            Policy::limited(request.redirect_times)
        };
        let client = reqwest::Client::builder()
            .timeout(request.timeout)
            .redirect(policy)
            .danger_accept_invalid_certs(true)
            .build()?;

        let method = reqwest::Method::from_bytes(info.method.as_bytes())
            .map_err(|e| {
                ReplacerError::InvalidPacket(format!("bad method {:?}: {}", info.method, e))
            })?;
        let mut builder = client.request(method, url.clone());

        // header_raw has the decoded transfer/content encodings removed
        for line in parse_head(info.header_raw.as_bytes()).header_lines {
            let (key, value) = split_header_line(&line);
            if CLIENT_MANAGED_HEADERS.iter().any(|h| key.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !info.body_raw.is_empty() {
            builder = builder.body(info.body_raw.clone());
        }

        debug!("Repeating {} {}", info.method, url);
        let response = builder.send().await?;
        let raw_response = response_to_raw(response).await?;

        Ok(ClientExchange {
            hidden_index: String::new(),
            url: url.to_string(),
            raw_request: request.packet,
            raw_response,
            source: request.source,
            tags: request.tags,
            color: None,
        })
    }
}

async fn response_to_raw(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let mut raw = format!(
        "{:?} {} {}{}",
        response.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        CRLF
    )
    .into_bytes();
    for (name, value) in response.headers() {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(CRLF.as_bytes());
    }
    raw.extend_from_slice(CRLF.as_bytes());
    let body = response.bytes().await?;
    raw.extend_from_slice(&body);
    Ok(raw)
}
