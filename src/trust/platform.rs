//! OS-native CA bundle discovery.
//!
//! Each platform answers one question through [`platform_ca_bundle`]: is
//! there an OS trust store we can hand to the TLS layer?
//!
//! - Windows: native certificate verification is used; nothing to locate.
//! - macOS: the system root keychain is exported to PEM at most once a week,
//!   skipping roots an administrator or user explicitly marked "deny".
//! - Other Unix: the first well-known distribution bundle that exists.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::process::CommandRunner;

/// Result of the platform lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformBundle {
    /// The OS verifies certificates itself.
    Native,
    /// A PEM bundle maintained by the OS (or exported from it).
    Path(PathBuf),
    /// No usable OS trust store; fall back to the managed bundle.
    Unavailable,
}

/// Well-known CA bundle locations across Linux distributions and BSDs.
pub const UNIX_BUNDLE_PATHS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/share/certs/ca-root-nss.crt",
];

/// How long an exported macOS keychain bundle is reused.
pub const KEYCHAIN_EXPORT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// File name of the exported keychain bundle inside the trust directory.
pub const KEYCHAIN_EXPORT_FILE: &str = "system-ca-bundle.crt";

const SYSTEM_ROOT_KEYCHAIN: &str = "/System/Library/Keychains/SystemRootCertificates.keychain";

/// Looks up the OS trust store for the current platform.
#[allow(unused_variables)]
pub fn platform_ca_bundle(data_dir: &Path, runner: &dyn CommandRunner) -> PlatformBundle {
    #[cfg(windows)]
    {
        PlatformBundle::Native
    }
    #[cfg(target_os = "macos")]
    {
        export_keychain_roots(data_dir, runner, SystemTime::now())
            .map_or(PlatformBundle::Unavailable, PlatformBundle::Path)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        let candidates: Vec<&Path> = UNIX_BUNDLE_PATHS.iter().map(Path::new).collect();
        probe_bundle_paths(&candidates).map_or(PlatformBundle::Unavailable, PlatformBundle::Path)
    }
    #[cfg(not(any(windows, unix)))]
    {
        PlatformBundle::Unavailable
    }
}

/// Returns the first candidate that is a non-empty file.
#[must_use]
pub fn probe_bundle_paths(candidates: &[&Path]) -> Option<PathBuf> {
    let found = candidates
        .iter()
        .find(|path| fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0))
        .map(|path| path.to_path_buf());
    match &found {
        Some(path) => debug!(path = %path.display(), "using system CA bundle"),
        None => debug!("no system CA bundle found"),
    }
    found
}

/// Exports the macOS system roots to `data_dir`, reusing a fresh export.
///
/// Returns `None` when the `security` tool is unavailable or yields nothing.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn export_keychain_roots(
    data_dir: &Path,
    runner: &dyn CommandRunner,
    now: SystemTime,
) -> Option<PathBuf> {
    let export_path = data_dir.join(KEYCHAIN_EXPORT_FILE);
    let fresh = fs::metadata(&export_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| now.duration_since(mtime).ok())
        .is_some_and(|age| age < KEYCHAIN_EXPORT_MAX_AGE);
    if fresh {
        return Some(export_path);
    }

    runner.locate("security")?;
    let denied = denied_certificate_hashes(runner);

    let args = vec![
        "find-certificate".to_string(),
        "-a".to_string(),
        "-p".to_string(),
        "-Z".to_string(),
        SYSTEM_ROOT_KEYCHAIN.to_string(),
    ];
    let output = runner.run("security", &args, &[]).ok()?;
    if !output.success() {
        warn!(stderr = %output.stderr_text(), "failed to export system keychain roots");
        return None;
    }
    let pem = filter_keychain_export(&String::from_utf8_lossy(&output.stdout), &denied);
    if pem.is_empty() {
        return None;
    }

    if let Err(e) = fs::create_dir_all(data_dir).and_then(|()| fs::write(&export_path, pem)) {
        warn!(error = %e, path = %export_path.display(), "failed to write keychain export");
        return None;
    }
    info!(path = %export_path.display(), denied = denied.len(), "exported system keychain roots");
    Some(export_path)
}

/// SHA-1 hashes of every certificate with an explicit deny trust setting.
fn denied_certificate_hashes(runner: &dyn CommandRunner) -> HashSet<String> {
    let mut names = HashSet::new();
    for domain_flag in [Some("-d"), None] {
        let mut args = vec!["dump-trust-settings".to_string()];
        args.extend(domain_flag.map(str::to_string));
        // No trust settings at all is reported as a failure; that just means nothing is denied.
        if let Ok(output) = runner.run("security", &args, &[])
            && output.success()
        {
            names.extend(parse_denied_names(&String::from_utf8_lossy(&output.stdout)));
        }
    }

    let mut hashes = HashSet::new();
    for name in names {
        let args = vec![
            "find-certificate".to_string(),
            "-a".to_string(),
            "-Z".to_string(),
            "-c".to_string(),
            name,
        ];
        if let Ok(output) = runner.run("security", &args, &[]) {
            hashes.extend(parse_sha1_hashes(&String::from_utf8_lossy(&output.stdout)));
        }
    }
    hashes
}

/// Names of certs whose trust settings contain `kSecTrustSettingsResultDeny`.
#[must_use]
pub fn parse_denied_names(dump: &str) -> HashSet<String> {
    let mut denied = HashSet::new();
    let mut current: Option<&str> = None;
    for line in dump.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Cert ")
            && let Some((_, name)) = rest.split_once(": ")
        {
            current = Some(name.trim());
            continue;
        }
        if trimmed.contains("kSecTrustSettingsResultDeny")
            && let Some(name) = current
        {
            denied.insert(name.to_string());
        }
    }
    denied
}

fn parse_sha1_hashes(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("SHA-1 hash:"))
        .map(|hash| hash.trim().to_ascii_uppercase())
        .collect()
}

/// Keeps PEM blocks whose preceding `SHA-1 hash:` is not in `denied`.
#[must_use]
pub fn filter_keychain_export(export: &str, denied: &HashSet<String>) -> String {
    let mut out = String::new();
    let mut current_hash = String::new();
    let mut block = String::new();
    let mut in_block = false;
    for line in export.lines() {
        let trimmed = line.trim();
        if let Some(hash) = trimmed.strip_prefix("SHA-1 hash:") {
            current_hash = hash.trim().to_ascii_uppercase();
            continue;
        }
        if trimmed == "-----BEGIN CERTIFICATE-----" {
            in_block = true;
            block.clear();
        }
        if in_block {
            block.push_str(trimmed);
            block.push('\n');
        }
        if trimmed == "-----END CERTIFICATE-----" && in_block {
            in_block = false;
            if denied.contains(&current_hash) {
                debug!(hash = %current_hash, "excluding denied root");
            } else {
                out.push_str(&block);
            }
        }
    }
    out
}
