//! File configuration and wiring of the fetch components.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::cache::HttpCache;
use crate::download::backends::{BackendFactory, BackendKind, TransportOptions};
use crate::download::constants::{
    DEFAULT_CACHE_TTL, DEFAULT_IDLE_WINDOW, DEFAULT_MAX_TRIES, DEFAULT_RATE_LIMIT_COOLDOWN,
    DEFAULT_TIMEOUT, DEFAULT_TRUST_COOLDOWN,
};
use crate::download::{DownloadRequest, FetchContext, RateLimiter, RetryPolicy};
use crate::manager::DownloadManager;
use crate::proxy::{ProxyCredentials, ProxySettings, parse_no_proxy};
use crate::trust::{CertEntry, CertTrustStore, TrustConfig};
use crate::user_agent::{self, DEFAULT_USER_AGENT_TEMPLATE};

const APP_DIR: &str = "pkgfetch";

/// TOML-backed configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Per-attempt timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Attempts per fetch, including the first.
    pub max_tries: Option<u32>,
    /// Age after which cache files are pruned.
    pub cache_ttl_secs: Option<u64>,
    /// User-Agent template; `%s` becomes the crate version.
    pub user_agent: Option<String>,
    /// Proxy for plain http URLs.
    pub http_proxy: Option<String>,
    /// Proxy for https URLs.
    pub https_proxy: Option<String>,
    /// Comma separated hosts reached without the proxy.
    pub no_proxy: Option<String>,
    /// Proxy account name.
    pub proxy_username: Option<String>,
    /// Proxy account password.
    pub proxy_password: Option<String>,
    /// How long a rate-limited domain stays blacklisted.
    pub rate_limit_cooldown_secs: Option<u64>,
    /// How long a domain that failed trust checks stays blacklisted.
    pub trust_cooldown_secs: Option<u64>,
    /// Quiet period before pooled downloaders are closed.
    pub idle_window_ms: Option<u64>,
    /// Base delay between retries; unset or zero retries immediately.
    pub retry_delay_ms: Option<u64>,
    /// Log cache write failures.
    pub debug: Option<bool>,
    /// Cache directory; set to an empty string to disable caching.
    pub cache_dir: Option<PathBuf>,
    /// Directory for the managed CA bundle and manifest.
    pub trust_dir: Option<PathBuf>,
    /// Bundle seeding the managed CA bundle.
    pub baseline_bundle: Option<PathBuf>,
    /// Consult the OS trust store first.
    pub use_platform_store: Option<bool>,
    /// Backend priority order.
    pub backends: Option<Vec<BackendKind>>,
    /// `domain = [cert_id, location]`; `"*"` applies to every domain.
    pub certs: BTreeMap<String, (String, String)>,
}

impl FetchConfig {
    /// Reads and validates a config file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, is not valid TOML, contains unknown
    /// keys, or holds out-of-range values.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config = Self::parse(&raw)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// Fails on syntax errors, unknown keys, or out-of-range values.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Describes the first offending key.
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout_secs
            && !(1..=3600).contains(&timeout)
        {
            bail!("Invalid config value for `timeout_secs`: {timeout}. Expected range: 1..=3600");
        }
        if let Some(tries) = self.max_tries
            && !(1..=20).contains(&tries)
        {
            bail!("Invalid config value for `max_tries`: {tries}. Expected range: 1..=20");
        }
        if let Some(window) = self.idle_window_ms
            && window > 600_000
        {
            bail!("Invalid config value for `idle_window_ms`: {window}. Expected range: 0..=600000");
        }
        if let Some(delay) = self.retry_delay_ms
            && delay > 60_000
        {
            bail!("Invalid config value for `retry_delay_ms`: {delay}. Expected range: 0..=60000");
        }
        if self
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.trim().is_empty())
        {
            bail!("Invalid config value for `user_agent`: must not be empty");
        }
        for (key, value) in [("http_proxy", &self.http_proxy), ("https_proxy", &self.https_proxy)] {
            if let Some(raw) = value {
                parse_proxy_url(raw)
                    .with_context(|| format!("Invalid config value for `{key}`: '{raw}'"))?;
            }
        }
        if self.proxy_password.is_some() && self.proxy_username.is_none() {
            bail!("`proxy_password` is set but `proxy_username` is missing");
        }
        if self.backends.as_ref().is_some_and(Vec::is_empty) {
            bail!("Invalid config value for `backends`: list must not be empty");
        }
        for (domain, (cert_id, location)) in &self.certs {
            if cert_id.trim().is_empty() || location.trim().is_empty() {
                bail!("Invalid `certs` entry for '{domain}': cert_id and location are required");
            }
        }
        Ok(())
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    /// Attempt budget.
    #[must_use]
    pub fn max_tries(&self) -> u32 {
        self.max_tries.unwrap_or(DEFAULT_MAX_TRIES)
    }

    /// Rendered User-Agent.
    #[must_use]
    pub fn user_agent(&self) -> String {
        user_agent::render(
            self.user_agent
                .as_deref()
                .unwrap_or(DEFAULT_USER_AGENT_TEMPLATE),
        )
    }

    /// Retry delay policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_delay_ms {
            Some(ms) if ms > 0 => RetryPolicy::with_backoff(Duration::from_millis(ms)),
            _ => RetryPolicy::immediate(),
        }
    }

    /// Proxy settings, falling back to the standard proxy environment variables.
    ///
    /// # Errors
    ///
    /// Fails when a proxy URL does not parse.
    pub fn proxy_settings(&self) -> Result<ProxySettings> {
        self.proxy_settings_with(|name| env::var(name).ok())
    }

    /// As [`proxy_settings`](Self::proxy_settings), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Fails when a proxy URL does not parse.
    pub fn proxy_settings_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProxySettings> {
        let pick = |configured: &Option<String>, scheme: &str| -> Result<Option<Url>> {
            let raw = configured
                .clone()
                .or_else(|| env_proxy_for_scheme(scheme, &lookup));
            raw.map(|raw| parse_proxy_url(&raw)).transpose()
        };
        let mut http_proxy = pick(&self.http_proxy, "http")?;
        let mut https_proxy = pick(&self.https_proxy, "https")?;

        let mut credentials = self.proxy_username.as_ref().map(|username| ProxyCredentials {
            username: username.clone(),
            password: self.proxy_password.clone().unwrap_or_default(),
        });
        for proxy in [&mut https_proxy, &mut http_proxy].into_iter().flatten() {
            let embedded = take_embedded_credentials(proxy);
            if credentials.is_none() {
                credentials = embedded;
            }
        }

        let no_proxy = self
            .no_proxy
            .clone()
            .or_else(|| {
                ["NO_PROXY", "no_proxy"]
                    .iter()
                    .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
            })
            .map(|raw| parse_no_proxy(&raw))
            .unwrap_or_default();

        Ok(ProxySettings {
            http_proxy,
            https_proxy,
            credentials,
            no_proxy,
        })
    }

    /// Cache directory, or `None` when caching is disabled.
    #[must_use]
    pub fn cache_dir(&self) -> Option<PathBuf> {
        match &self.cache_dir {
            Some(dir) if dir.as_os_str().is_empty() => None,
            Some(dir) => Some(dir.clone()),
            None => Some(
                base_dir("XDG_CACHE_HOME", &[".cache"])
                    .unwrap_or_else(env::temp_dir)
                    .join(APP_DIR),
            ),
        }
    }

    /// Trust directory.
    #[must_use]
    pub fn trust_dir(&self) -> PathBuf {
        self.trust_dir.clone().unwrap_or_else(|| {
            base_dir("XDG_DATA_HOME", &[".local", "share"])
                .unwrap_or_else(env::temp_dir)
                .join(APP_DIR)
                .join("certs")
        })
    }

    /// Trust store settings.
    #[must_use]
    pub fn trust_config(&self) -> TrustConfig {
        let entries: HashMap<String, CertEntry> = self
            .certs
            .iter()
            .map(|(domain, (cert_id, location))| {
                (
                    domain.to_ascii_lowercase(),
                    CertEntry::new(cert_id.clone(), location.clone()),
                )
            })
            .collect();
        TrustConfig {
            dir: self.trust_dir(),
            baseline_bundle: self.baseline_bundle.clone(),
            entries,
            cooldown: self
                .trust_cooldown_secs
                .map_or(DEFAULT_TRUST_COOLDOWN, Duration::from_secs),
            use_platform_store: self.use_platform_store.unwrap_or(true),
        }
    }

    /// Builds the components shared by every downloader.
    ///
    /// # Errors
    ///
    /// Fails when the cache directory cannot be created.
    pub fn build_context(&self) -> Result<FetchContext> {
        let user_agent = self.user_agent();
        let cache = match self.cache_dir() {
            Some(dir) => {
                let ttl = self.cache_ttl_secs.map_or(DEFAULT_CACHE_TTL, Duration::from_secs);
                let cache = HttpCache::new(&dir, ttl)
                    .with_context(|| format!("Failed to open cache directory '{}'", dir.display()))?
                    .with_debug(self.debug.unwrap_or(false));
                Some(Arc::new(cache))
            }
            None => None,
        };
        Ok(FetchContext {
            cache,
            trust: Arc::new(CertTrustStore::new(self.trust_config(), &user_agent)),
            rate_limiter: Arc::new(RateLimiter::new(
                self.rate_limit_cooldown_secs
                    .map_or(DEFAULT_RATE_LIMIT_COOLDOWN, Duration::from_secs),
            )),
            retry: self.retry_policy(),
            user_agent,
        })
    }

    /// Builds a pool over the configured backends.
    ///
    /// # Errors
    ///
    /// Fails when the context cannot be built or a proxy URL is invalid.
    pub fn build_manager(&self) -> Result<DownloadManager> {
        let context = self.build_context()?;
        let options = TransportOptions {
            proxy: self.proxy_settings()?,
            user_agent: context.user_agent.clone(),
        };
        let factory = BackendFactory::new(self.backends.clone().unwrap_or_default(), options, context);
        let idle_window = self.idle_window_ms.map_or(DEFAULT_IDLE_WINDOW, Duration::from_millis);
        Ok(DownloadManager::with_idle_window(Arc::new(factory), idle_window))
    }

    /// A request for `url` carrying the configured timeout and attempt budget.
    #[must_use]
    pub fn request(&self, url: impl Into<String>) -> DownloadRequest {
        DownloadRequest::new(url)
            .with_timeout(self.timeout())
            .with_max_tries(self.max_tries())
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed config, or defaults when no file exists.
    pub config: FetchConfig,
    /// Whether the config came from disk.
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/pkgfetch/config.toml`
/// 2. `$HOME/.config/pkgfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    base_dir("XDG_CONFIG_HOME", &[".config"]).map(|dir| dir.join(APP_DIR).join("config.toml"))
}

/// Loads `path`, or the default path when `None`. A missing default file
/// yields defaults; a missing explicit file is an error.
///
/// # Errors
///
/// Fails when the file exists but cannot be loaded.
pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = path {
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: FetchConfig::load(path)?,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(existing) if existing.exists() => Ok(LoadedConfig {
            config: FetchConfig::load(existing)?,
            path,
            loaded_from_file: true,
        }),
        _ => Ok(LoadedConfig {
            path,
            config: FetchConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn base_dir(xdg_var: &str, home_suffix: &[&str]) -> Option<PathBuf> {
    if let Some(dir) = env_var_non_empty_os(xdg_var) {
        return Some(PathBuf::from(dir));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        home_suffix
            .iter()
            .fold(PathBuf::from(home), |path, part| path.join(part)),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn env_proxy_for_scheme(scheme: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    let names: &[&str] = match scheme {
        "https" => &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"],
        "http" => &["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"],
        _ => return None,
    };
    names.iter().find_map(|name| {
        lookup(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a proxy URL, assuming `http://` when no scheme is given.
fn parse_proxy_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let url = if raw.contains("://") {
        Url::parse(raw)?
    } else {
        Url::parse(&format!("http://{raw}"))?
    };
    if url.host_str().is_none() {
        bail!("proxy URL has no host");
    }
    Ok(url)
}

/// Moves `user:pass@` out of a proxy URL.
fn take_embedded_credentials(url: &mut Url) -> Option<ProxyCredentials> {
    if url.username().is_empty() {
        return None;
    }
    let credentials = ProxyCredentials {
        username: url.username().to_string(),
        password: url.password().unwrap_or_default().to_string(),
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);
    Some(credentials)
}
