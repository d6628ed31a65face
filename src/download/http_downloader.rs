//! The shared fetch algorithm every backend runs.

use std::sync::Arc;

use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_ENCODING, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    USER_AGENT,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::ACCEPT_ENCODING as ACCEPT_ENCODING_VALUE;
use super::{
    DownloadRequest, Downloader, FetchError, HttpRequest, HttpResponse, RateLimiter,
    RetryDecision, RetryPolicy, Transport, classify_error, decode_body, extract_domain,
};
use crate::cache::HttpCache;
use crate::trust::{CertTrustStore, TrustAnchor};

/// Components shared by every downloader the pool creates.
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Response cache; `None` disables caching entirely.
    pub cache: Option<Arc<HttpCache>>,
    /// CA trust resolution for https URLs.
    pub trust: Arc<CertTrustStore>,
    /// Rate-limit blacklist.
    pub rate_limiter: Arc<RateLimiter>,
    /// Delay policy between attempts.
    pub retry: RetryPolicy,
    /// Rendered User-Agent header.
    pub user_agent: String,
}

/// A [`Downloader`] running the common algorithm over a [`Transport`].
#[derive(Debug)]
pub struct HttpDownloader<T: Transport> {
    transport: T,
    context: FetchContext,
}

impl<T: Transport> HttpDownloader<T> {
    /// Wraps `transport` with the shared fetch components.
    pub fn new(transport: T, context: FetchContext) -> Self {
        Self { transport, context }
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn build_request(&self, url: Url, request: &DownloadRequest) -> HttpRequest {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.context.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(ACCEPT_ENCODING_VALUE),
        );

        let metadata = self
            .context
            .cache
            .as_ref()
            .and_then(|cache| cache.metadata(&request.url));
        if let Some(meta) = metadata {
            if let Some(etag) = meta.etag.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(IF_NONE_MATCH, etag);
            }
            if let Some(lm) = meta
                .last_modified
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                headers.insert(IF_MODIFIED_SINCE, lm);
            }
        }

        HttpRequest {
            url,
            headers,
            timeout: request.timeout,
        }
    }

    /// One attempt: send, then interpret the status.
    fn attempt(
        &mut self,
        http_request: &HttpRequest,
        trust: &TrustAnchor,
        request: &DownloadRequest,
    ) -> Result<Vec<u8>, FetchError> {
        let url = request.url.as_str();
        let response = self.transport.execute(http_request, trust)?;
        let status = response.status;

        // Quota headers count even on error statuses.
        self.context
            .rate_limiter
            .handle_rate_limit(&response.headers, url)?;

        if status == 407 {
            let proxy = self
                .transport
                .proxy_for(&http_request.url)
                .unwrap_or_else(|| "proxy".to_string());
            return Err(FetchError::proxy_auth(
                &proxy,
                prefixed(
                    &request.error_message,
                    &format!("HTTP error 407 from proxy {proxy} downloading {url}."),
                ),
            ));
        }
        if status == 503 {
            return Err(FetchError::service_unavailable(
                url,
                prefixed(&request.error_message, &format!("HTTP error 503 downloading {url}.")),
            ));
        }
        if status != 304 && !(200..300).contains(&status) {
            return Err(FetchError::protocol(
                url,
                Some(status),
                prefixed(
                    &request.error_message,
                    &format!("HTTP error {status} downloading {url}."),
                ),
            ));
        }

        let HttpResponse { headers, body, .. } = response;
        let body = if status == 304 {
            body
        } else {
            let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());
            decode_body(encoding, body).map_err(|detail| {
                FetchError::protocol(
                    url,
                    Some(status),
                    prefixed(&request.error_message, &format!("{detail} from {url}.")),
                )
            })?
        };

        match &self.context.cache {
            Some(cache) => {
                cache.cache_result("GET", url, status, &headers, body, &request.error_message)
            }
            None if status == 304 => Err(FetchError::cache_miss(
                url,
                prefixed(
                    &request.error_message,
                    &format!("HTTP 304 received for {url} but caching is disabled."),
                ),
            )),
            None => Ok(body),
        }
    }
}

impl<T: Transport> Downloader for HttpDownloader<T> {
    fn name(&self) -> &'static str {
        self.transport.name()
    }

    #[instrument(skip(self, request), fields(backend = self.transport.name(), url = %request.url))]
    fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
        let url = Url::parse(&request.url).map_err(|_| FetchError::invalid_url(&request.url))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(FetchError::invalid_url(&request.url));
        }
        let domain = extract_domain(&request.url);

        if request.prefer_cached
            && let Some(cache) = &self.context.cache
            && let Some(cached) = cache.get(&HttpCache::key_for(&request.url, ""))
        {
            debug!("serving cached copy without network request");
            return Ok(cached);
        }

        self.context
            .rate_limiter
            .check(&request.url)
            .map_err(|e| e.with_prefix(&request.error_message))?;

        let https = url.scheme() == "https";
        if https && !self.transport.supports_ssl() {
            return Err(FetchError::configuration(prefixed(
                &request.error_message,
                &format!(
                    "the {} backend cannot fetch {} because it lacks TLS support",
                    self.transport.name(),
                    request.url
                ),
            )));
        }
        let trust = if https {
            self.context
                .trust
                .check_certs(&domain, request.timeout)
                .map_err(|e| e.with_prefix(&request.error_message))?
        } else {
            TrustAnchor::Native
        };

        let http_request = self.build_request(url, request);
        let mut attempt = 1;
        loop {
            let error = match self.attempt(&http_request, &trust, request) {
                Ok(body) => {
                    debug!(attempt, bytes = body.len(), "fetch complete");
                    return Ok(body);
                }
                Err(error) => error.with_prefix(&request.error_message),
            };

            match self
                .context
                .retry
                .should_retry(classify_error(&error), attempt, request.max_tries)
            {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    info!(attempt, error = %error, "transient failure, retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    let mut error = error;
                    if error.is_transient() {
                        error.append_message(&format!(" (gave up after {attempt} tries)"));
                    }
                    if matches!(error, FetchError::Trust { .. }) {
                        self.context.trust.record_failure(&domain);
                    }
                    warn!(attempt, reason = %reason, error = %error, "fetch failed");
                    return Err(error);
                }
            }
        }
    }

    fn close(&mut self) {
        debug!(backend = self.transport.name(), "closing transport");
        self.transport.close();
    }

    fn supports_ssl(&self) -> bool {
        self.transport.supports_ssl()
    }
}

fn prefixed(prefix: &str, detail: &str) -> String {
    if prefix.is_empty() {
        detail.to_string()
    } else {
        format!("{prefix} {detail}")
    }
}
