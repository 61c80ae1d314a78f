//! Cookie-based session affinity.

use chrono::{DateTime, Utc};
use hyper::header::{self, HeaderMap, HeaderValue, InvalidHeaderValue};
use meridian_core::config::StickyConfig;
use std::time::Duration;

/// Affinity cookie settings for one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyPolicy {
    cookie_name: String,
    ttl: Duration,
}

impl StickyPolicy {
    /// Create a policy issuing `cookie_name` for `ttl`.
    pub fn new(cookie_name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            ttl,
        }
    }

    /// Policy for an enabled sticky configuration.
    pub fn from_config(config: &StickyConfig) -> Self {
        Self::new(config.cookie_name.clone(), Duration::from_secs(config.ttl))
    }

    /// Name of the affinity cookie.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Backend address pinned by the request's affinity cookie, if any.
    pub fn affinity<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim_matches('"'))
            .filter(|value| !value.is_empty())
    }

    /// `Set-Cookie` value binding the client to `address` until `now + ttl`.
    pub fn set_cookie(&self, address: &str, now: DateTime<Utc>) -> Result<HeaderValue, InvalidHeaderValue> {
        let expires = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now);

        HeaderValue::from_str(&format!(
            "{}={}; Path=/; Max-Age={}; Expires={}; HttpOnly",
            self.cookie_name,
            address,
            self.ttl.as_secs(),
            expires.format("%a, %d %b %Y %H:%M:%S GMT"),
        ))
    }
}
