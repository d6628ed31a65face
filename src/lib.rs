//! pkgfetch library
//!
//! Pooled, cache-aware HTTP(S) fetching for package metadata and archives.
//!
//! # Architecture
//!
//! - [`download`] - the [`Downloader`] trait, the shared fetch algorithm, and
//!   the native/curl/wget transports
//! - [`manager`] - per-host pool of downloaders with an idle timer
//! - [`background`] - one worker thread per host for parallel prefetching
//! - [`cache`] - on-disk response cache with ETag/Last-Modified sidecars
//! - [`trust`] - CA bundle resolution and maintenance
//! - [`proxy`] - proxy settings, CONNECT handshake and Digest/Basic answers
//! - [`config`] - TOML configuration and component wiring

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod background;
pub mod cache;
pub mod config;
pub mod download;
pub mod manager;
pub mod process;
pub mod proxy;
pub mod trust;
pub mod user_agent;

// Re-export commonly used types
pub use background::{BackgroundFetchCoordinator, FetchOutcome};
pub use cache::HttpCache;
pub use config::{FetchConfig, LoadedConfig, load_config, resolve_default_config_path};
pub use download::backends::{BackendFactory, BackendKind, DownloaderFactory, TransportOptions};
pub use download::{
    DownloadRequest, Downloader, FailureType, FetchContext, FetchError, HttpDownloader,
    NetworkFailure, RateLimiter, RetryDecision, RetryPolicy, classify_error,
};
pub use manager::{Checkout, DownloadManager, PooledConnection};
pub use proxy::{ProxyAuthenticator, ProxyCredentials, ProxySettings};
pub use trust::{CertEntry, CertTrustStore, TrustAnchor, TrustConfig};
