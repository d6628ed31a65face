//! Backend downloaders: one fetch algorithm, several transports.
//!
//! A [`Downloader`] is what the pool hands out. Every concrete downloader is an
//! [`HttpDownloader`] wrapped around a [`Transport`] - the native reqwest
//! client, a `curl` process, or a `wget` process - so caching, rate-limit
//! handling, trust resolution, content decoding and retries behave the same
//! regardless of how bytes reach the wire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pkgfetch::download::{DownloadRequest, Downloader, FetchContext, HttpDownloader};
//! use pkgfetch::download::backends::ReqwestTransport;
//!
//! # fn example(context: FetchContext) -> Result<(), Box<dyn std::error::Error>> {
//! let mut downloader = HttpDownloader::new(ReqwestTransport::new(Default::default()), context);
//! let request = DownloadRequest::new("https://packages.example.com/channel.json")
//!     .with_error_message("Error downloading channel.")
//!     .with_timeout(Duration::from_secs(10));
//! let bytes = downloader.fetch(&request)?;
//! println!("{} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod constants;
mod encoding;
mod error;
mod http_downloader;
pub mod rate_limiter;
mod retry;

use std::io;
use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;

pub use encoding::decode_body;
pub use error::{FetchError, NetworkFailure};
pub use http_downloader::{FetchContext, HttpDownloader};
pub use rate_limiter::{RateLimiter, extract_domain};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};

use crate::trust::TrustAnchor;
use constants::{DEFAULT_MAX_TRIES, DEFAULT_TIMEOUT};

/// One fetch call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Absolute http(s) URL.
    pub url: String,
    /// Prefix for every error message produced by this call.
    pub error_message: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Maximum number of attempts, including the first.
    pub max_tries: u32,
    /// Serve an existing cache entry without touching the network.
    pub prefer_cached: bool,
}

impl DownloadRequest {
    /// Creates a request with default timeout and tries.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            error_message: String::new(),
            timeout: DEFAULT_TIMEOUT,
            max_tries: DEFAULT_MAX_TRIES,
            prefer_cached: false,
        }
    }

    /// Sets the error message prefix.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt budget (at least one).
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Serve from cache when possible.
    #[must_use]
    pub fn prefer_cached(mut self, prefer_cached: bool) -> Self {
        self.prefer_cached = prefer_cached;
        self
    }
}

/// A single request as handed to a transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Target URL.
    pub url: Url,
    /// Headers to send (User-Agent, Accept-Encoding, validators).
    pub headers: HeaderMap,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// A raw response as produced by a transport. Body is still content-encoded.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Final status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Undecoded body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Header value as a string, if present and valid.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A wire mechanism able to execute one HTTP GET.
///
/// Implementations return `Ok` for every HTTP status the server produced and
/// reserve `Err` for failures below HTTP (sockets, TLS, process spawning).
pub trait Transport: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether this transport can speak TLS.
    fn supports_ssl(&self) -> bool;

    /// Executes `request`, validating TLS against `trust` for https URLs.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for network, TLS or process failures.
    fn execute(&mut self, request: &HttpRequest, trust: &TrustAnchor)
    -> Result<HttpResponse, FetchError>;

    /// Releases sockets, processes or clients held by the transport.
    fn close(&mut self);

    /// `host:port` of the proxy `url` is routed through, if any.
    fn proxy_for(&self, _url: &Url) -> Option<String> {
        None
    }
}

/// The capability set the pool checks out: fetch, close, TLS support.
pub trait Downloader: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Fetches `request.url`, returning the decoded body.
    ///
    /// # Errors
    ///
    /// Returns one of the [`FetchError`] variants; see the variant docs for
    /// which ones were retried.
    fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError>;

    /// Releases the underlying transport. The downloader may be reused
    /// afterwards; it reconnects lazily.
    fn close(&mut self);

    /// Whether https URLs can be fetched.
    fn supports_ssl(&self) -> bool;
}

impl<D: Downloader + ?Sized> Downloader for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn fetch(&mut self, request: &DownloadRequest) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(request)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn supports_ssl(&self) -> bool {
        (**self).supports_ssl()
    }
}

/// Maps a socket-level IO error to the taxonomy.
pub(crate) fn io_failure(url: &str, error: &io::Error) -> FetchError {
    let kind = match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkFailure::Timeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => NetworkFailure::Reset,
        _ => NetworkFailure::Connect,
    };
    FetchError::transient(url, kind, format!("{kind} talking to {url}: {error}"))
}
