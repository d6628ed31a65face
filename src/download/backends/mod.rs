//! Concrete transports and the factory that picks between them.
//!
//! Backends are tried in a fixed priority order, native reqwest first, then
//! the `curl` and `wget` command-line tools. A backend is only considered
//! when it is available on this machine; the native one always is.
//! Availability and TLS support are resolved once per factory.
//!
//! There is no backend over an OS-specific network API; the native backend
//! already validates against the platform verifier.

pub mod curl;
pub mod native;
pub mod wget;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use curl::CurlTransport;
pub use native::ReqwestTransport;
pub use wget::WgetTransport;

use super::{Downloader, FetchContext, FetchError, HttpDownloader, Transport};
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::proxy::ProxySettings;
use crate::user_agent;

/// Settings every transport receives.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Proxies and proxy credentials.
    pub proxy: ProxySettings,
    /// Value of the `User-Agent` header, used where a transport makes its own
    /// requests (CONNECT probes).
    pub user_agent: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::default(),
            user_agent: user_agent::default_user_agent(),
        }
    }
}

/// Known backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process reqwest client.
    Native,
    /// The `curl` command-line tool.
    Curl,
    /// The `wget` command-line tool.
    Wget,
}

impl BackendKind {
    /// Default priority order.
    pub const PRIORITY: [Self; 3] = [Self::Native, Self::Curl, Self::Wget];

    /// Lowercase name used in config files and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Curl => "curl",
            Self::Wget => "wget",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "reqwest" => Ok(Self::Native),
            "curl" => Ok(Self::Curl),
            "wget" => Ok(Self::Wget),
            other => Err(format!("unknown backend '{other}' (expected native, curl or wget)")),
        }
    }
}

/// Produces downloaders for the pool.
pub trait DownloaderFactory: Send + Sync + fmt::Debug {
    /// Builds an instance of the preferred backend.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Configuration`] when no backend is available.
    fn create(&self) -> Result<Box<dyn Downloader>, FetchError>;

    /// Builds the highest-priority backend able to speak TLS.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Configuration`] when no TLS-capable backend exists.
    fn create_tls_capable(&self) -> Result<Box<dyn Downloader>, FetchError>;
}

/// An installed backend; TLS support is checked on first need.
#[derive(Debug, Clone)]
struct Capability {
    kind: BackendKind,
    tls: OnceLock<bool>,
}

/// [`DownloaderFactory`] over the built-in backends.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    order: Vec<BackendKind>,
    options: TransportOptions,
    context: FetchContext,
    runner: Arc<dyn CommandRunner>,
    capabilities: OnceLock<Vec<Capability>>,
}

impl BackendFactory {
    /// Creates a factory trying `order` front to back.
    ///
    /// An empty order falls back to [`BackendKind::PRIORITY`].
    #[must_use]
    pub fn new(order: Vec<BackendKind>, options: TransportOptions, context: FetchContext) -> Self {
        let order = if order.is_empty() {
            BackendKind::PRIORITY.to_vec()
        } else {
            order
        };
        Self {
            order,
            options,
            context,
            runner: Arc::new(SystemCommandRunner),
            capabilities: OnceLock::new(),
        }
    }

    /// Replaces the runner used by the command-line backends.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self.capabilities = OnceLock::new();
        self
    }

    /// The configured backend order.
    #[must_use]
    pub fn order(&self) -> &[BackendKind] {
        &self.order
    }

    /// Whether `kind` can run on this machine.
    #[must_use]
    pub fn is_available(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Native => true,
            BackendKind::Curl | BackendKind::Wget => self.runner.locate(kind.name()).is_some(),
        }
    }

    fn capabilities(&self) -> &[Capability] {
        self.capabilities.get_or_init(|| {
            let found: Vec<Capability> = self
                .order
                .iter()
                .copied()
                .filter(|kind| self.is_available(*kind))
                .map(|kind| Capability {
                    kind,
                    tls: OnceLock::new(),
                })
                .collect();
            debug!(
                backends = %join_names(&found.iter().map(|c| c.kind).collect::<Vec<_>>()),
                "resolved available backends"
            );
            found
        })
    }

    fn tls_support(&self, capability: &Capability) -> bool {
        *capability.tls.get_or_init(|| match capability.kind {
            BackendKind::Native => true,
            BackendKind::Curl => {
                CurlTransport::new(self.options.clone(), Arc::clone(&self.runner)).supports_ssl()
            }
            BackendKind::Wget => {
                WgetTransport::new(self.options.clone(), Arc::clone(&self.runner)).supports_ssl()
            }
        })
    }

    fn instantiate(&self, capability: &Capability) -> Box<dyn Downloader> {
        let tls = self.tls_support(capability);
        let context = self.context.clone();
        let options = self.options.clone();
        match capability.kind {
            BackendKind::Native => Box::new(HttpDownloader::new(ReqwestTransport::new(options), context)),
            BackendKind::Curl => Box::new(HttpDownloader::new(
                CurlTransport::new(options, Arc::clone(&self.runner)).with_tls_support(tls),
                context,
            )),
            BackendKind::Wget => Box::new(HttpDownloader::new(
                WgetTransport::new(options, Arc::clone(&self.runner)).with_tls_support(tls),
                context,
            )),
        }
    }
}

impl DownloaderFactory for BackendFactory {
    fn create(&self) -> Result<Box<dyn Downloader>, FetchError> {
        let capability = self.capabilities().first().ok_or_else(|| {
            FetchError::configuration(format!(
                "none of the configured backends ({}) is available",
                join_names(&self.order)
            ))
        })?;
        debug!(backend = %capability.kind, "creating downloader");
        Ok(self.instantiate(capability))
    }

    fn create_tls_capable(&self) -> Result<Box<dyn Downloader>, FetchError> {
        let capability = self
            .capabilities()
            .iter()
            .find(|c| self.tls_support(c))
            .ok_or_else(|| {
                FetchError::configuration(format!(
                    "no TLS-capable backend is available (tried {})",
                    join_names(&self.order)
                ))
            })?;
        debug!(backend = %capability.kind, "creating TLS-capable downloader");
        Ok(self.instantiate(capability))
    }
}

fn join_names(kinds: &[BackendKind]) -> String {
    kinds
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses the status and headers of the last HTTP response in a header dump.
///
/// Dumps may hold several responses (redirects, a proxy's CONNECT reply);
/// only the final one describes the body.
pub(crate) fn parse_last_response<'a>(
    lines: impl IntoIterator<Item = &'a str>,
) -> Option<(u16, HeaderMap)> {
    let mut last = None;
    let mut current: Option<(u16, HeaderMap)> = None;
    for line in lines {
        let line = line.trim();
        if let Some(status) = parse_status_line(line) {
            if current.is_some() {
                last = current.take();
            }
            current = Some((status, HeaderMap::new()));
            continue;
        }
        let Some((_, headers)) = current.as_mut() else {
            continue;
        };
        if line.is_empty() {
            last = current.take();
            continue;
        }
        if let Some((name, value)) = line.split_once(':')
            && let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes())
            && let Ok(value) = HeaderValue::from_str(value.trim())
        {
            headers.append(name, value);
        }
    }
    current.or(last)
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Whole seconds for tools that only take integers, never below one.
pub(crate) fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Joins a header into the `Name: value` form the CLI tools accept.
pub(crate) fn header_lines(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| format!("{}: {v}", name.as_str()))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tempfile::TempDir;

    use crate::download::{RateLimiter, RetryPolicy};
    use crate::process::testing::ScriptedRunner;
    use crate::trust::{CertTrustStore, TrustConfig};

    fn context(dir: &TempDir) -> FetchContext {
        FetchContext {
            cache: None,
            trust: Arc::new(CertTrustStore::new(
                TrustConfig {
                    dir: dir.path().to_path_buf(),
                    baseline_bundle: None,
                    entries: HashMap::new(),
                    cooldown: Duration::from_secs(1),
                    use_platform_store: false,
                },
                "test",
            )),
            rate_limiter: Arc::new(RateLimiter::new(Duration::from_secs(1))),
            retry: RetryPolicy::immediate(),
            user_agent: "test".to_string(),
        }
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("CURL".parse::<BackendKind>().unwrap(), BackendKind::Curl);
        assert_eq!("reqwest".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert!("winhttp".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Wget.to_string(), "wget");
    }

    #[test]
    fn test_factory_skips_missing_tools() {
        let dir = TempDir::new().unwrap();
        let factory = BackendFactory::new(
            vec![BackendKind::Curl, BackendKind::Wget],
            TransportOptions::default(),
            context(&dir),
        )
        .with_runner(Arc::new(ScriptedRunner::new(&["wget"])));

        assert!(!factory.is_available(BackendKind::Curl));
        assert_eq!(factory.create().unwrap().name(), "wget");
    }

    #[test]
    fn test_factory_without_any_backend_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let factory = BackendFactory::new(
            vec![BackendKind::Curl],
            TransportOptions::default(),
            context(&dir),
        )
        .with_runner(Arc::new(ScriptedRunner::new(&[])));
        assert!(matches!(factory.create(), Err(FetchError::Configuration { .. })));
        assert!(matches!(
            factory.create_tls_capable(),
            Err(FetchError::Configuration { .. })
        ));
    }

    #[test]
    fn test_tls_capable_skips_tool_without_ssl() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(&["wget"]);
        runner.push(crate::process::ProcessOutput {
            code: Some(0),
            stdout: b"GNU Wget 1.21 built on linux-gnu.\n-cares +digest -gpgme -https +ipv6 -ssl\n".to_vec(),
            stderr: Vec::new(),
        });
        let factory = BackendFactory::new(
            vec![BackendKind::Wget, BackendKind::Native],
            TransportOptions::default(),
            context(&dir),
        )
        .with_runner(Arc::new(runner));

        let downloader = factory.create_tls_capable().unwrap();
        assert_eq!(downloader.name(), "native");
    }

    #[test]
    fn test_tls_support_checked_once_per_factory() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(&["curl"]));
        runner.push(crate::process::ProcessOutput {
            code: Some(0),
            stdout: b"curl 8.5.0\nProtocols: http https\n".to_vec(),
            stderr: Vec::new(),
        });
        let factory = BackendFactory::new(
            vec![BackendKind::Curl],
            TransportOptions::default(),
            context(&dir),
        )
        .with_runner(runner.clone());

        for _ in 0..3 {
            assert!(factory.create().unwrap().supports_ssl());
            assert_eq!(factory.create_tls_capable().unwrap().name(), "curl");
        }
        assert_eq!(runner.calls().len(), 1, "{:?}", runner.calls());
    }

    #[test]
    fn test_empty_order_uses_priority() {
        let dir = TempDir::new().unwrap();
        let factory = BackendFactory::new(Vec::new(), TransportOptions::default(), context(&dir));
        assert_eq!(factory.order(), &BackendKind::PRIORITY);
    }

    #[test]
    fn test_parse_last_response_picks_final_block() {
        let dump = "HTTP/1.1 200 Connection established\r\n\r\nHTTP/1.1 301 Moved\r\nLocation: /b\r\n\r\nHTTP/2 200\r\ncontent-type: application/json\r\netag: \"abc\"\r\n\r\n";
        let (status, headers) = parse_last_response(dump.lines()).unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get("etag").unwrap(), "\"abc\"");
        assert!(headers.get("location").is_none());
    }

    #[test]
    fn test_parse_last_response_without_status_is_none() {
        assert!(parse_last_response("garbage\nmore".lines()).is_none());
    }

    #[test]
    fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(whole_seconds(Duration::from_secs(10)), 10);
        assert_eq!(whole_seconds(Duration::ZERO), 1);
    }
}
