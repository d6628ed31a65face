//! Retry classification and delay policy for failed fetch attempts.
//!
//! When an attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - timeouts, resets, DNS blips and HTTP 503
//! - [`FailureType::Permanent`] - any other status or malformed response
//! - [`FailureType::RateLimited`] - zero remaining API quota
//! - [`FailureType::Untrusted`] - no usable trust anchor
//! - [`FailureType::NeedsProxyAuth`] - proxy rejected our credentials
//!
//! Only transient failures are retried. The [`RetryPolicy`] bounds the number
//! of attempts by the request's `max_tries` and decides how long to wait
//! between them. The default policy retries immediately.
//!
//! # Example
//!
//! ```
//! use pkgfetch::download::{FailureType, FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::service_unavailable("https://example.com/channel.json", "HTTP 503");
//!
//! match policy.should_retry(classify_error(&error), 1, 3) {
//!     RetryDecision::Retry { delay, attempt } => assert!(delay.is_zero() && attempt == 2),
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Maximum delay cap when backoff is enabled (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to non-zero delays (250ms).
const MAX_JITTER: Duration = Duration::from_millis(250);

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Failure that won't succeed regardless of retries.
    Permanent,

    /// Server reported zero remaining quota.
    RateLimited,

    /// No trust anchor could validate the server.
    Untrusted,

    /// The proxy refused our credentials.
    NeedsProxyAuth,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the request.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Delay configuration between attempts.
///
/// With the default `base_delay` of zero every retry is immediate. A non-zero
/// base delay enables exponential backoff:
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl RetryPolicy {
    /// A policy that retries transient failures without waiting.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// A policy with exponential backoff starting at `base_delay`.
    #[must_use]
    pub fn with_backoff(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::immediate()
        }
    }

    /// Returns the configured base delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Determines whether to retry after attempt number `attempt` (1-indexed) failed.
    #[instrument(skip(self))]
    pub fn should_retry(
        &self,
        failure_type: FailureType,
        attempt: u32,
        max_attempts: u32,
    ) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::RateLimited => {
                return RetryDecision::DoNotRetry {
                    reason: "rate limit quota exhausted".to_string(),
                };
            }
            FailureType::Untrusted => {
                return RetryDecision::DoNotRetry {
                    reason: "no trust anchor for server".to_string(),
                };
            }
            FailureType::NeedsProxyAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "proxy rejected credentials".to_string(),
                };
            }
            FailureType::Transient => {}
        }

        if attempt >= max_attempts.max(1) {
            debug!(attempt, max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({max_attempts}) exhausted"),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(capped_ms as u64) + Duration::from_millis(jitter_ms)
    }
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | TransientNetwork | Transient |
/// | ServiceUnavailable (503) | Transient |
/// | RateLimited | RateLimited |
/// | Trust | Untrusted |
/// | ProxyAuth | NeedsProxyAuth |
/// | everything else | Permanent |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::TransientNetwork { .. } | FetchError::ServiceUnavailable { .. } => {
            FailureType::Transient
        }
        FetchError::RateLimited { .. } => FailureType::RateLimited,
        FetchError::Trust { .. } => FailureType::Untrusted,
        FetchError::ProxyAuth { .. } => FailureType::NeedsProxyAuth,
        FetchError::Configuration { .. }
        | FetchError::Protocol { .. }
        | FetchError::CacheMiss { .. }
        | FetchError::InvalidUrl { .. } => FailureType::Permanent,
    }
}
