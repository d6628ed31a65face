//! Proxy configuration and `Proxy-Authorization` computation.
//!
//! When a CONNECT tunnel is answered with `407 Proxy Authentication Required`,
//! the [`ProxyAuthenticator`] parses the advertised schemes, prefers Digest
//! over Basic, and produces the header value for the single retry. The
//! tunnel handshake itself lives in [`tunnel`].

pub mod digest;
pub mod tunnel;

use base64::Engine;
use tracing::debug;
use url::Url;

use crate::download::FetchError;
use digest::{DigestAlgorithm, DigestInput, digest_authorization};

/// Username and password sent to the proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    /// Proxy account name.
    pub username: String,
    /// Proxy account password.
    pub password: String,
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Proxies to route plain and TLS traffic through.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    /// Proxy for `http://` URLs.
    pub http_proxy: Option<Url>,
    /// Proxy for `https://` URLs (reached with CONNECT).
    pub https_proxy: Option<Url>,
    /// Credentials, when the proxy requires them.
    pub credentials: Option<ProxyCredentials>,
    /// Hosts reached directly, in `NO_PROXY` syntax (`*`, `.corp`, `host:port`).
    pub no_proxy: Vec<String>,
}

impl ProxySettings {
    /// Picks the proxy for `url`, honouring the bypass list.
    #[must_use]
    pub fn for_url(&self, url: &Url) -> Option<&Url> {
        let proxy = self.for_scheme(url.scheme())?;
        match url.host_str() {
            Some(host) if self.bypasses(host) => None,
            _ => Some(proxy),
        }
    }

    /// Whether `host` matches an entry of the bypass list.
    ///
    /// Entries match the host itself and its subdomains; a leading dot and a
    /// trailing port are ignored.
    #[must_use]
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.no_proxy.iter().any(|entry| {
            let entry = entry.trim();
            if entry == "*" {
                return true;
            }
            let entry = strip_port(entry).trim_start_matches('.');
            !entry.is_empty()
                && (host.eq_ignore_ascii_case(entry)
                    || host
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", entry.to_ascii_lowercase())))
        })
    }

    /// Picks the proxy for a target URL scheme.
    #[must_use]
    pub fn for_scheme(&self, scheme: &str) -> Option<&Url> {
        match scheme {
            "https" => self.https_proxy.as_ref(),
            "http" => self.http_proxy.as_ref(),
            _ => None,
        }
    }

    /// Whether any proxy is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.http_proxy.is_none() && self.https_proxy.is_none()
    }
}

/// Splits a comma separated `NO_PROXY` value into entries.
#[must_use]
pub fn parse_no_proxy(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_port(entry: &str) -> &str {
    if let Some(inner) = entry.strip_prefix('[') {
        return inner.split(']').next().unwrap_or(inner);
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => entry,
    }
}

/// `host:port` of a proxy URL, as shown in errors and logs.
#[must_use]
pub fn proxy_label(proxy: &Url) -> String {
    format!(
        "{}:{}",
        proxy.host_str().unwrap_or("unknown"),
        proxy.port_or_known_default().unwrap_or(80)
    )
}

/// A digest challenge from a `Proxy-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection realm.
    pub realm: String,
    /// Server nonce.
    pub nonce: String,
    /// Offered qop values, e.g. `["auth", "auth-int"]`.
    pub qop: Vec<String>,
    /// Advertised algorithm, as spelled by the server.
    pub algorithm: Option<String>,
    /// Opaque value to echo back.
    pub opaque: Option<String>,
}

/// A parsed authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyChallenge {
    /// `Basic realm="..."`.
    Basic {
        /// Protection realm.
        realm: Option<String>,
    },
    /// `Digest realm="...", nonce="...", ...`.
    Digest(DigestChallenge),
}

/// Parses all supported challenges from `Proxy-Authenticate` header values.
///
/// Unknown schemes and digest challenges missing `realm` or `nonce` are skipped.
#[must_use]
pub fn parse_challenges<S: AsRef<str>>(header_values: &[S]) -> Vec<ProxyChallenge> {
    header_values
        .iter()
        .filter_map(|value| parse_challenge(value.as_ref()))
        .collect()
}

fn parse_challenge(value: &str) -> Option<ProxyChallenge> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
    let params = parse_params(rest);
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(ProxyChallenge::Basic { realm: get("realm") });
    }
    if scheme.eq_ignore_ascii_case("digest") {
        let qop = get("qop")
            .map(|q| {
                q.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        return Some(ProxyChallenge::Digest(DigestChallenge {
            realm: get("realm")?,
            nonce: get("nonce")?,
            qop,
            algorithm: get("algorithm"),
            opaque: get("opaque"),
        }));
    }
    debug!(scheme = %scheme, "ignoring unsupported proxy auth scheme");
    None
}

/// Splits `k1="v, 1", k2=v2` into pairs, honouring quoted commas.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after_eq = after_eq.trim_start();
        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_eq.find(',') {
                Some(end) => (after_eq[..end].trim().to_string(), &after_eq[end..]),
                None => (after_eq.trim().to_string(), ""),
            }
        };
        params.push((key, value));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// Computes `Proxy-Authorization` values for CONNECT tunnels.
#[derive(Debug, Clone)]
pub struct ProxyAuthenticator {
    credentials: ProxyCredentials,
}

impl ProxyAuthenticator {
    /// Creates an authenticator for the given credentials.
    #[must_use]
    pub fn new(credentials: ProxyCredentials) -> Self {
        Self { credentials }
    }

    /// `Basic base64(user:pass)`.
    #[must_use]
    pub fn basic(&self) -> String {
        let raw = format!("{}:{}", self.credentials.username, self.credentials.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    /// Answers the preferred challenge for a CONNECT to `host:port`.
    ///
    /// Digest is preferred over Basic. A random client nonce is generated when
    /// `qop=auth` is offered.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ProxyAuth`] when no offered scheme can be answered.
    pub fn authorization_for(
        &self,
        challenges: &[ProxyChallenge],
        host: &str,
        port: u16,
        proxy: &str,
    ) -> Result<String, FetchError> {
        let cnonce = format!("{:016x}", rand::random::<u64>());
        let digest = challenges.iter().find_map(|c| match c {
            ProxyChallenge::Digest(d) => self.digest(d, host, port, &cnonce),
            ProxyChallenge::Basic { .. } => None,
        });
        if let Some(header) = digest {
            debug!(proxy = %proxy, "answering proxy digest challenge");
            return Ok(header);
        }
        if challenges
            .iter()
            .any(|c| matches!(c, ProxyChallenge::Basic { .. }))
        {
            debug!(proxy = %proxy, "answering proxy basic challenge");
            return Ok(self.basic());
        }
        Err(FetchError::proxy_auth(
            proxy,
            format!("proxy {proxy} requested authentication with no supported scheme"),
        ))
    }

    /// Digest answer with a caller-supplied client nonce.
    ///
    /// Returns `None` when the challenge uses an unsupported algorithm or only
    /// offers `auth-int`.
    #[must_use]
    pub fn digest(
        &self,
        challenge: &DigestChallenge,
        host: &str,
        port: u16,
        cnonce: &str,
    ) -> Option<String> {
        let algorithm = DigestAlgorithm::from_challenge(challenge.algorithm.as_deref())?;
        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.iter().any(|q| q == "auth") {
            Some("auth")
        } else {
            return None;
        };
        let uri = format!("{host}:{port}");
        let input = DigestInput {
            username: &self.credentials.username,
            password: &self.credentials.password,
            realm: &challenge.realm,
            nonce: &challenge.nonce,
            method: "CONNECT",
            uri: &uri,
            qop,
            cnonce,
            algorithm,
        };
        Some(digest_authorization(
            &input,
            challenge.algorithm.as_deref(),
            challenge.opaque.as_deref(),
        ))
    }
}
