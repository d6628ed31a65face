//! Constants for the download module (timeouts, retries, cooldowns).

use std::time::Duration;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum attempts per fetch (including the first).
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// How long a domain stays blacklisted after reporting zero rate-limit quota.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(3600);

/// How long a domain stays blacklisted after a trust failure.
pub const DEFAULT_TRUST_COOLDOWN: Duration = Duration::from_secs(3600);

/// Quiet period after which all pooled downloaders are closed.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(5);

/// Default cache entry lifetime, enforced once at cache construction.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Value sent in `Accept-Encoding` on every request.
pub const ACCEPT_ENCODING: &str = "gzip,deflate";

/// Content types that are never written to the HTTP cache.
pub const UNCACHEABLE_CONTENT_TYPES: &[&str] = &["application/zip", "application/octet-stream"];
