//! CA trust resolution for HTTPS fetches.
//!
//! [`CertTrustStore::check_certs`] answers "which trust anchors validate this
//! domain?". The OS trust store wins when one exists. Otherwise the store
//! maintains its own bundle:
//!
//! - `ca-bundle.crt` - append-only concatenation of PEM certificates, seeded
//!   from an optional baseline bundle
//! - `ca-list.json` - manifest of the `cert_id`s already merged into the bundle
//!
//! Configured `{domain: [cert_id, location]}` entries (plus the `"*"` wildcard)
//! are merged lazily, the first time a domain is fetched. The bundle is always
//! written before the manifest, so an id listed in the manifest is guaranteed
//! to have its PEM in the bundle.

pub mod platform;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;
use tracing::{debug, info, instrument, warn};

use crate::download::FetchError;
use crate::process::{CommandRunner, SystemCommandRunner};
use platform::{PlatformBundle, platform_ca_bundle};

/// Bundle file name inside the trust directory.
pub const BUNDLE_FILE: &str = "ca-bundle.crt";

/// Manifest file name inside the trust directory.
pub const MANIFEST_FILE: &str = "ca-list.json";

const LOCK_FILE: &str = ".ca.lock";

/// Domain key that applies to every domain.
pub const WILDCARD_DOMAIN: &str = "*";

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

/// How a TLS connection should be validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TrustAnchor {
    /// Use the platform verifier and built-in roots.
    #[default]
    Native,
    /// Use exactly the certificates in this PEM bundle.
    Bundle(PathBuf),
}

/// A CA certificate expected for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    /// Opaque identifier used to detect whether the cert is merged.
    pub cert_id: String,
    /// `http(s)://` URL or local filesystem path of the PEM.
    pub location: String,
}

impl CertEntry {
    /// Creates an entry.
    pub fn new(cert_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            cert_id: cert_id.into(),
            location: location.into(),
        }
    }
}

/// Loads certificate bytes from a location.
pub trait CertSource: Send + Sync + std::fmt::Debug {
    /// Returns the raw bytes at `location`.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure.
    fn load(&self, location: &str, timeout: Duration) -> Result<Vec<u8>, String>;
}

/// Loads http(s) locations with a plain blocking client and everything else
/// from the filesystem.
#[derive(Debug, Clone)]
pub struct DefaultCertSource {
    user_agent: String,
}

impl DefaultCertSource {
    /// Creates a source sending `user_agent` on remote loads.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl CertSource for DefaultCertSource {
    fn load(&self, location: &str, timeout: Duration) -> Result<Vec<u8>, String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .user_agent(&self.user_agent)
                .build()
                .map_err(|e| e.to_string())?;
            let response = client.get(location).send().map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("HTTP {} fetching {location}", response.status().as_u16()));
            }
            return response
                .bytes()
                .map(|b| b.to_vec())
                .map_err(|e| e.to_string());
        }
        let path = location.strip_prefix("file://").unwrap_or(location);
        fs::read(path).map_err(|e| format!("{e} reading {path}"))
    }
}

/// Settings for a [`CertTrustStore`].
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Directory holding the bundle, manifest and lock file.
    pub dir: PathBuf,
    /// Bundle copied into place when none exists yet.
    pub baseline_bundle: Option<PathBuf>,
    /// Expected CA per domain; `"*"` applies to all.
    pub entries: HashMap<String, CertEntry>,
    /// How long a domain stays blacklisted after a trust failure.
    pub cooldown: Duration,
    /// Consult the OS trust store before the managed bundle.
    pub use_platform_store: bool,
}

/// Resolves and maintains CA trust anchors.
#[derive(Debug)]
pub struct CertTrustStore {
    config: TrustConfig,
    source: Arc<dyn CertSource>,
    runner: Arc<dyn CommandRunner>,
    platform: OnceLock<PlatformBundle>,
    blacklist: DashMap<String, Instant>,
    merge_lock: Mutex<()>,
}

impl CertTrustStore {
    /// Creates a store using the default cert source and system commands.
    #[must_use]
    pub fn new(config: TrustConfig, user_agent: &str) -> Self {
        Self::with_source(config, Arc::new(DefaultCertSource::new(user_agent)))
    }

    /// Creates a store loading certificates through `source`.
    #[must_use]
    pub fn with_source(config: TrustConfig, source: Arc<dyn CertSource>) -> Self {
        Self {
            config,
            source,
            runner: Arc::new(SystemCommandRunner),
            platform: OnceLock::new(),
            blacklist: DashMap::new(),
            merge_lock: Mutex::new(()),
        }
    }

    /// Replaces the command runner used for platform discovery.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Path of the managed bundle.
    #[must_use]
    pub fn bundle_path(&self) -> PathBuf {
        self.config.dir.join(BUNDLE_FILE)
    }

    /// Path of the manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.config.dir.join(MANIFEST_FILE)
    }

    /// Resolves the trust anchor for `domain`, merging configured certs as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Trust`] when no anchor can be produced; the domain
    /// is then blacklisted for the cooldown window and later calls fail
    /// without any I/O.
    #[instrument(skip(self))]
    pub fn check_certs(&self, domain: &str, timeout: Duration) -> Result<TrustAnchor, FetchError> {
        let domain = domain.to_ascii_lowercase();
        self.check_blacklist(&domain)?;

        if self.config.use_platform_store {
            match self.platform_bundle() {
                PlatformBundle::Native => return Ok(TrustAnchor::Native),
                PlatformBundle::Path(path) => return Ok(TrustAnchor::Bundle(path.clone())),
                PlatformBundle::Unavailable => {}
            }
        }

        match self.merge_for_domain(&domain, timeout) {
            Ok(path) => Ok(TrustAnchor::Bundle(path)),
            Err(message) => {
                warn!(domain = %domain, error = %message, "no trust anchor, blacklisting domain");
                self.blacklist
                    .insert(domain.clone(), Instant::now() + self.config.cooldown);
                Err(FetchError::trust(domain, message))
            }
        }
    }

    /// Records a TLS validation failure observed by a transport.
    pub fn record_failure(&self, domain: &str) {
        self.blacklist.insert(
            domain.to_ascii_lowercase(),
            Instant::now() + self.config.cooldown,
        );
    }

    /// The set of `cert_id`s currently merged.
    #[must_use]
    pub fn merged_ids(&self) -> BTreeSet<String> {
        read_manifest(&self.manifest_path())
    }

    fn check_blacklist(&self, domain: &str) -> Result<(), FetchError> {
        let expired = match self.blacklist.get(domain) {
            None => return Ok(()),
            Some(until) if *until > Instant::now() => {
                return Err(FetchError::trust(
                    domain,
                    format!("{domain} failed certificate checks recently; skipping"),
                ));
            }
            Some(_) => true,
        };
        if expired {
            self.blacklist.remove(domain);
        }
        Ok(())
    }

    fn platform_bundle(&self) -> &PlatformBundle {
        self.platform
            .get_or_init(|| platform_ca_bundle(&self.config.dir, self.runner.as_ref()))
    }

    fn merge_for_domain(&self, domain: &str, timeout: Duration) -> Result<PathBuf, String> {
        let _guard = self
            .merge_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&self.config.dir)
            .map_err(|e| format!("cannot create {}: {e}", self.config.dir.display()))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.config.dir.join(LOCK_FILE))
            .map_err(|e| format!("cannot open trust lock: {e}"))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| format!("cannot lock trust directory: {e}"))?;
        let result = self.merge_locked(domain, timeout);
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn merge_locked(&self, domain: &str, timeout: Duration) -> Result<PathBuf, String> {
        let bundle_path = self.bundle_path();
        let manifest_path = self.manifest_path();
        self.seed_from_baseline(&bundle_path)?;

        let mut manifest = read_manifest(&manifest_path);
        for key in [domain, WILDCARD_DOMAIN] {
            let Some(entry) = self.config.entries.get(key) else {
                continue;
            };
            if manifest.contains(&entry.cert_id) {
                debug!(cert_id = %entry.cert_id, "certificate already merged");
                continue;
            }

            info!(cert_id = %entry.cert_id, location = %entry.location, "merging CA certificate");
            let bytes = self
                .source
                .load(&entry.location, timeout)
                .map_err(|e| format!("unable to load CA cert {} for {key}: {e}", entry.cert_id))?;
            let pem = String::from_utf8(bytes)
                .ok()
                .filter(|text| text.contains(PEM_BEGIN))
                .ok_or_else(|| {
                    format!("CA cert {} from {} is not PEM", entry.cert_id, entry.location)
                })?;

            append_pem(&bundle_path, &pem)
                .map_err(|e| format!("cannot append to {}: {e}", bundle_path.display()))?;
            manifest.insert(entry.cert_id.clone());
            write_manifest(&manifest_path, &manifest)
                .map_err(|e| format!("cannot write {}: {e}", manifest_path.display()))?;
        }

        let has_certs = fs::read_to_string(&bundle_path)
            .map(|text| text.contains(PEM_BEGIN))
            .unwrap_or(false);
        if !has_certs {
            return Err(format!("no CA certificate is available to validate {domain}"));
        }
        Ok(bundle_path)
    }

    fn seed_from_baseline(&self, bundle_path: &Path) -> Result<(), String> {
        if bundle_path.exists() {
            return Ok(());
        }
        match &self.config.baseline_bundle {
            Some(baseline) => {
                fs::copy(baseline, bundle_path).map_err(|e| {
                    format!("cannot copy baseline bundle {}: {e}", baseline.display())
                })?;
                debug!(baseline = %baseline.display(), "seeded CA bundle from baseline");
            }
            None => {
                fs::File::create(bundle_path).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

fn append_pem(bundle_path: &Path, pem: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(bundle_path)?;
    let mut block = String::with_capacity(pem.len() + 2);
    block.push('\n');
    block.push_str(pem.trim());
    block.push('\n');
    file.write_all(block.as_bytes())?;
    file.sync_all()
}

fn read_manifest(path: &Path) -> BTreeSet<String> {
    fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or_default()
}

fn write_manifest(path: &Path, manifest: &BTreeSet<String>) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}
