//! Per-domain API rate-limit tracking.
//!
//! Package hosts such as GitHub report the remaining request quota in
//! `X-RateLimit-Remaining`. Once a response says the quota is spent, the
//! domain is blacklisted for a cooldown window so further fetches fail fast
//! without touching the network.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pkgfetch::download::RateLimiter;
//! use reqwest::header::{HeaderMap, HeaderValue};
//!
//! let limiter = RateLimiter::new(Duration::from_secs(60));
//! let mut headers = HeaderMap::new();
//! headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
//! headers.insert("x-ratelimit-limit", HeaderValue::from_static("60"));
//!
//! assert!(limiter.handle_rate_limit(&headers, "https://api.github.com/repos").is_err());
//! assert!(limiter.check("https://api.github.com/other").is_err());
//! assert!(limiter.check("https://example.com/").is_ok());
//! ```

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use tracing::{debug, instrument, warn};

use super::FetchError;

/// Header carrying the remaining request quota.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Header carrying the total request quota.
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Per-domain rate-limit blacklist.
///
/// Shared across pooled downloaders via `Arc`. Reads may observe a record that
/// is about to expire; that only delays the next real request.
#[derive(Debug)]
pub struct RateLimiter {
    cooldown: Duration,
    blocked: DashMap<String, RateLimitRecord>,
}

#[derive(Debug, Clone)]
struct RateLimitRecord {
    until: Instant,
    limit: String,
}

impl RateLimiter {
    /// Creates a rate limiter that blacklists domains for `cooldown`.
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        debug!(cooldown_secs = cooldown.as_secs(), "creating rate limiter");
        Self {
            cooldown,
            blocked: DashMap::new(),
        }
    }

    /// Returns the blacklist window.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Fails fast if the URL's domain is still blacklisted.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::RateLimited`] while the domain's cooldown is active.
    #[instrument(level = "debug", skip(self), fields(domain))]
    pub fn check(&self, url: &str) -> Result<(), FetchError> {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", &domain);

        let expired = match self.blocked.get(&domain) {
            None => return Ok(()),
            Some(record) if record.until > Instant::now() => {
                debug!(domain = %domain, "domain is rate limited, skipping request");
                return Err(FetchError::rate_limited(domain, record.limit.clone()));
            }
            Some(_) => true,
        };
        if expired {
            self.blocked.remove(&domain);
        }
        Ok(())
    }

    /// Inspects response headers and blacklists the domain when quota is spent.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::RateLimited`] carrying the domain and the
    /// `X-RateLimit-Limit` value when `X-RateLimit-Remaining` reads zero.
    #[instrument(level = "debug", skip(self, headers))]
    pub fn handle_rate_limit(&self, headers: &HeaderMap, url: &str) -> Result<(), FetchError> {
        let Some(remaining) = header_str(headers, RATE_LIMIT_REMAINING) else {
            return Ok(());
        };
        if remaining.trim() != "0" {
            return Ok(());
        }

        let domain = extract_domain(url);
        let limit = header_str(headers, RATE_LIMIT_LIMIT)
            .map_or_else(|| "unknown".to_string(), |v| v.trim().to_string());
        self.record(&domain, &limit);
        Err(FetchError::rate_limited(domain, limit))
    }

    /// Blacklists `domain` for the cooldown window.
    pub fn record(&self, domain: &str, limit: &str) {
        warn!(
            domain = %domain,
            limit = %limit,
            cooldown_secs = self.cooldown.as_secs(),
            "rate limit exhausted, blacklisting domain"
        );
        self.blocked.insert(
            domain.to_string(),
            RateLimitRecord {
                until: Instant::now() + self.cooldown,
                limit: limit.to_string(),
            },
        );
    }

    /// Number of domains currently tracked (including expired, unswept ones).
    #[must_use]
    pub fn tracked_domains(&self) -> usize {
        self.blocked.len()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extracts the lowercase host from a URL.
///
/// Returns "unknown" for malformed URLs so they still share one bucket.
///
/// # Examples
///
/// ```
/// use pkgfetch::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://example.com/path"), "example.com");
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}
