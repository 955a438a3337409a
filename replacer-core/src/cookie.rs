//! Cookie parsing and re-serialization for request `Cookie` headers.

use replacer_common::CookieOverride;
use tracing::error;

/// A name/value cookie pair as carried by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Parse a `Cookie` header value: `a=1; b=2`
pub fn parse_cookie_header(value: &str) -> Vec<Cookie> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((name, value)) => Cookie::new(name.trim(), value.trim()),
            None => Cookie::new(part, ""),
        })
        .collect()
}

/// Parse a `Set-Cookie` header value; only the leading pair is kept
pub fn parse_set_cookie_header(value: &str) -> Option<Cookie> {
    let first = value.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Cookie::new(name, value.trim()))
}

/// Serialize cookies into one `Cookie` header value.
///
/// Later cookies with the same name override the earlier value but keep
/// the earlier position.
pub fn merge_cookies(cookies: &[Cookie]) -> String {
    let mut merged: Vec<(&str, &str)> = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        let existing = merged.iter().position(|(name, _)| *name == cookie.name);
        match existing {
            Some(idx) => merged[idx].1 = cookie.value.as_str(),
            None => merged.push((cookie.name.as_str(), cookie.value.as_str())),
        }
    }
    merged
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convert configured cookie overrides into request cookies
pub fn overrides_to_cookies(overrides: &[CookieOverride]) -> Vec<Cookie> {
    overrides
        .iter()
        .map(|c| {
            if let Err(mode) = c.same_site() {
                error!("invalid same site mode: {}", mode);
            }
            Cookie::new(c.key.clone(), c.value.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("a=1; b=2;;c");
        assert_eq!(
            cookies,
            vec![Cookie::new("a", "1"), Cookie::new("b", "2"), Cookie::new("c", "")]
        );
    }

    #[test]
    fn test_parse_set_cookie_header() {
        assert_eq!(
            parse_set_cookie_header("sid=abc; Path=/; HttpOnly"),
            Some(Cookie::new("sid", "abc"))
        );
        assert_eq!(parse_set_cookie_header("garbage"), None);
    }

    #[test]
    fn test_merge_cookies_override_keeps_position() {
        let cookies = vec![
            Cookie::new("a", "1"),
            Cookie::new("b", "2"),
            Cookie::new("a", "3"),
            Cookie::new("c", "4"),
        ];
        assert_eq!(merge_cookies(&cookies), "a=3; b=2; c=4");
    }

    #[test]
    fn test_overrides_to_cookies() {
        let mut over = CookieOverride::new("token", "xyz");
        over.same_site_mode = "bogus".to_string();
        assert_eq!(overrides_to_cookies(&[over]), vec![Cookie::new("token", "xyz")]);
    }
}
