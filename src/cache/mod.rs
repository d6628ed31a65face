//! On-disk HTTP response cache with conditional-request metadata.
//!
//! Each cached URL occupies two files under the cache directory:
//!
//! - `<sha256(url)>` - the decoded response body
//! - `<sha256(url)>.info` - JSON sidecar `{"etag": ..., "last-modified": ...}`
//!
//! Entries older than the configured TTL are swept once when the cache is
//! constructed; there is no background eviction.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::download::FetchError;
use crate::download::constants::UNCACHEABLE_CONTENT_TYPES;

/// Suffix of the sidecar metadata entry.
pub const INFO_SUFFIX: &str = ".info";

/// Validators stored alongside a cached body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// `ETag` of the cached response.
    pub etag: Option<String>,
    /// `Last-Modified` of the cached response.
    #[serde(rename = "last-modified")]
    pub last_modified: Option<String>,
}

/// Filesystem key-value store for response bodies.
#[derive(Debug, Clone)]
pub struct HttpCache {
    dir: PathBuf,
    debug: bool,
}

impl HttpCache {
    /// Opens (creating if needed) the cache at `dir` and sweeps entries older than `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the cache directory cannot be created.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display(), ttl_secs = ttl.as_secs()))]
    pub fn new(dir: impl AsRef<Path>, ttl: Duration) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let cache = Self { dir, debug: false };
        let removed = cache.clear(ttl);
        if removed > 0 {
            info!(removed, "pruned expired cache entries");
        }
        Ok(cache)
    }

    /// Enables logging of swallowed cache-write failures.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Builds the cache key for a URL, plus an optional suffix.
    #[must_use]
    pub fn key_for(url: &str, suffix: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        format!("{}{suffix}", hex::encode(digest))
    }

    /// Returns the stored bytes for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(key)).ok()
    }

    /// Whether an entry exists for `key`.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Stores `bytes` under `key`, replacing any previous value atomically.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the temporary file cannot be written or renamed.
    pub fn set(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }

    /// Deletes every entry whose modification time is older than `ttl`.
    ///
    /// Returns the number of files removed.
    pub fn clear(&self, ttl: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            if age > ttl && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), age_secs = age.as_secs(), "removed expired cache file");
                removed += 1;
            }
        }
        removed
    }

    /// Loads the validators stored for `url`, when both body and sidecar exist.
    #[must_use]
    pub fn metadata(&self, url: &str) -> Option<CacheMetadata> {
        if !self.has(&Self::key_for(url, "")) {
            return None;
        }
        let raw = self.get(&Self::key_for(url, INFO_SUFFIX))?;
        serde_json::from_slice(&raw).ok()
    }

    /// Runs the store/retrieve policy for a finished response.
    ///
    /// - non-GET and non-200/304 responses pass through untouched
    /// - 304 returns the stored body, or [`FetchError::CacheMiss`] if none exists
    /// - 200 is stored unless `Cache-Control: no-store` or a binary archive type
    ///
    /// Write failures are swallowed; the fresh body is still returned.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::CacheMiss`] for a 304 without a stored body.
    pub fn cache_result(
        &self,
        method: &str,
        url: &str,
        status: u16,
        headers: &HeaderMap,
        body: Vec<u8>,
        error_message: &str,
    ) -> Result<Vec<u8>, FetchError> {
        if !method.eq_ignore_ascii_case("GET") {
            return Ok(body);
        }

        let key = Self::key_for(url, "");
        if status == 304 {
            return match self.get(&key) {
                Some(cached) => {
                    debug!(url = %url, "using cached body for 304 response");
                    if let Err(e) = self.refresh(url, headers)
                        && self.debug
                    {
                        debug!(url = %url, error = %e, "failed to refresh cache entry");
                    }
                    Ok(cached)
                }
                None => Err(FetchError::cache_miss(
                    url,
                    format!("{error_message} HTTP 304 received for {url} but no cached copy exists.")
                        .trim_start()
                        .to_string(),
                )),
            };
        }
        if status != 200 || !is_cacheable(headers) {
            return Ok(body);
        }

        let metadata = CacheMetadata {
            etag: header_string(headers, ETAG.as_str()),
            last_modified: header_string(headers, LAST_MODIFIED.as_str()),
        };
        if let Err(e) = self.store(url, &metadata, &body) {
            if self.debug {
                debug!(url = %url, error = %e, "failed to write cache entry");
            }
        }
        Ok(body)
    }

    /// Writes the body, then its sidecar. The old sidecar goes first so its
    /// validators never sit next to a body they do not describe.
    fn store(&self, url: &str, metadata: &CacheMetadata, body: &[u8]) -> io::Result<()> {
        match fs::remove_file(self.path_for(&Self::key_for(url, INFO_SUFFIX))) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        self.set(&Self::key_for(url, ""), body)?;
        self.write_info(url, metadata)
    }

    /// Restarts the TTL clock of a revalidated entry and records any
    /// validators the 304 carried.
    fn refresh(&self, url: &str, headers: &HeaderMap) -> io::Result<()> {
        let previous = self.metadata(url).unwrap_or_default();
        let metadata = CacheMetadata {
            etag: header_string(headers, ETAG.as_str()).or(previous.etag),
            last_modified: header_string(headers, LAST_MODIFIED.as_str())
                .or(previous.last_modified),
        };
        fs::File::options()
            .write(true)
            .open(self.path_for(&Self::key_for(url, "")))?
            .set_modified(SystemTime::now())?;
        self.write_info(url, &metadata)
    }

    fn write_info(&self, url: &str, metadata: &CacheMetadata) -> io::Result<()> {
        let info = serde_json::to_vec(metadata).map_err(io::Error::other)?;
        self.set(&Self::key_for(url, INFO_SUFFIX), &info)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

/// Whether a 200 response with these headers may be persisted.
#[must_use]
pub fn is_cacheable(headers: &HeaderMap) -> bool {
    if header_string(headers, CACHE_CONTROL.as_str())
        .is_some_and(|cc| cc.to_ascii_lowercase().contains("no-store"))
    {
        return false;
    }
    let content_type = header_string(headers, CONTENT_TYPE.as_str())
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    !UNCACHEABLE_CONTENT_TYPES.contains(&content_type.as_str())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
