//! Error taxonomy shared by every fetch component.
//!
//! All failures surface as one [`FetchError`] family carrying a human-readable
//! message plus the structured data (domain, limit, status) callers need to
//! decide what to do next.

use std::fmt;

use thiserror::Error;

/// Which kind of low-level network failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    /// Connect or read timed out.
    Timeout,
    /// Peer reset the connection.
    Reset,
    /// Connection refused or otherwise could not be established.
    Connect,
    /// Hostname resolution failed.
    Dns,
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timed out",
            Self::Reset => "connection reset",
            Self::Connect => "connection failed",
            Self::Dns => "host lookup failed",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while fetching a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The fetch setup cannot work, e.g. no TLS-capable backend for an HTTPS URL.
    #[error("{message}")]
    Configuration {
        /// Description of the misconfiguration.
        message: String,
    },

    /// Timeout, reset, DNS blip. Retried up to `max_tries`.
    #[error("{message}")]
    TransientNetwork {
        /// The URL being fetched.
        url: String,
        /// Failure category.
        kind: NetworkFailure,
        /// Human-readable message.
        message: String,
    },

    /// HTTP 503. Treated as transient.
    #[error("{message}")]
    ServiceUnavailable {
        /// The URL being fetched.
        url: String,
        /// Human-readable message.
        message: String,
    },

    /// The server reported zero remaining API quota.
    #[error("{message}")]
    RateLimited {
        /// Domain that is now blacklisted.
        domain: String,
        /// Value of the `X-RateLimit-Limit` header.
        limit: String,
        /// Human-readable message.
        message: String,
    },

    /// No CA anchor could be resolved, or the certificate did not validate.
    #[error("{message}")]
    Trust {
        /// Domain the trust check failed for.
        domain: String,
        /// Human-readable message.
        message: String,
    },

    /// Any other unexpected status or malformed response.
    #[error("{message}")]
    Protocol {
        /// The URL being fetched.
        url: String,
        /// HTTP status, when one was received.
        status: Option<u16>,
        /// Human-readable message.
        message: String,
    },

    /// Proxy rejected the credentials a second time.
    #[error("{message}")]
    ProxyAuth {
        /// Proxy host and port.
        proxy: String,
        /// Human-readable message.
        message: String,
    },

    /// A 304 arrived but no cached body exists to serve.
    #[error("{message}")]
    CacheMiss {
        /// The URL being fetched.
        url: String,
        /// Human-readable message.
        message: String,
    },

    /// The URL could not be parsed or has no host.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl FetchError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a transient network error.
    pub fn transient(url: impl Into<String>, kind: NetworkFailure, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            kind,
            message: message.into(),
        }
    }

    /// Creates a service-unavailable (503) error.
    pub fn service_unavailable(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a rate-limit error.
    pub fn rate_limited(domain: impl Into<String>, limit: impl Into<String>) -> Self {
        let domain = domain.into();
        let limit = limit.into();
        let message = format!("rate limit of {limit} requests exceeded for {domain}");
        Self::RateLimited {
            domain,
            limit,
            message,
        }
    }

    /// Creates a trust error.
    pub fn trust(domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Trust {
            domain: domain.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates a proxy authentication error.
    pub fn proxy_auth(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProxyAuth {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates a cache-miss error for a 304 with nothing cached.
    pub fn cache_miss(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheMiss {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Whether the failure may succeed if the request is repeated.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::ServiceUnavailable { .. }
        )
    }

    /// The domain carried by rate-limit and trust errors.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::RateLimited { domain, .. } | Self::Trust { domain, .. } => Some(domain),
            _ => None,
        }
    }

    /// The HTTP status associated with the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServiceUnavailable { .. } => Some(503),
            Self::Protocol { status, .. } => *status,
            Self::ProxyAuth { .. } => Some(407),
            Self::CacheMiss { .. } => Some(304),
            _ => None,
        }
    }

    fn message_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Configuration { message }
            | Self::TransientNetwork { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::RateLimited { message, .. }
            | Self::Trust { message, .. }
            | Self::Protocol { message, .. }
            | Self::ProxyAuth { message, .. }
            | Self::CacheMiss { message, .. } => Some(message),
            Self::InvalidUrl { .. } => None,
        }
    }

    /// Appends context to the human-readable message, where one exists.
    pub(crate) fn append_message(&mut self, suffix: &str) {
        if let Some(message) = self.message_mut() {
            message.push_str(suffix);
        }
    }

    /// Puts the caller's context in front of the message unless it is already there.
    #[must_use]
    pub(crate) fn with_prefix(mut self, prefix: &str) -> Self {
        if !prefix.is_empty()
            && let Some(message) = self.message_mut()
            && !message.starts_with(prefix)
        {
            *message = format!("{prefix} {message}");
        }
        self
    }
}
