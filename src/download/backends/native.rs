//! In-process transport on `reqwest::blocking`.

use std::collections::HashMap;
use std::error::Error as _;
use std::fs;

use reqwest::{NoProxy, Proxy};
use reqwest::blocking::Client;
use reqwest::header::HeaderValue;
use tracing::{debug, instrument, warn};
use url::Url;

use super::TransportOptions;
use crate::download::{FetchError, HttpRequest, HttpResponse, NetworkFailure, Transport};
use crate::proxy::{ProxyAuthenticator, proxy_label, tunnel};
use crate::trust::TrustAnchor;

/// Native transport. Always TLS-capable.
///
/// Clients are built lazily, one per trust anchor and tunnel credential, and
/// dropped again by [`Transport::close`].
#[derive(Debug)]
pub struct ReqwestTransport {
    options: TransportOptions,
    clients: HashMap<ClientKey, Client>,
    tunnels: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    trust: TrustAnchor,
    tunnel_auth: Option<String>,
}

impl ReqwestTransport {
    /// Creates a transport; no sockets are opened until the first request.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            clients: HashMap::new(),
            tunnels: HashMap::new(),
        }
    }

    /// Number of clients currently held.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// `host:port` of an https target reached through an authenticating proxy.
    fn tunnel_target(&self, url: &Url) -> Option<String> {
        if url.scheme() != "https" || self.options.proxy.credentials.is_none() {
            return None;
        }
        self.options.proxy.for_url(url)?;
        let host = url.host_str()?;
        Some(format!("{host}:{}", url.port_or_known_default().unwrap_or(443)))
    }

    /// Runs the CONNECT handshake once per target when an https proxy with
    /// credentials is configured, remembering the accepted header.
    fn tunnel_authorization(&mut self, request: &HttpRequest) -> Result<Option<String>, FetchError> {
        let url = &request.url;
        let Some(target) = self.tunnel_target(url) else {
            return Ok(None);
        };
        if let Some(cached) = self.tunnels.get(&target) {
            return Ok(cached.clone());
        }
        let (Some(proxy), Some(credentials)) = (
            self.options.proxy.for_url(url),
            self.options.proxy.credentials.as_ref(),
        ) else {
            return Ok(None);
        };
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::invalid_url(url.as_str()))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let authenticator = ProxyAuthenticator::new(credentials.clone());
        let accepted = tunnel::negotiate(
            proxy,
            host,
            port,
            &self.options.user_agent,
            Some(&authenticator),
            request.timeout,
        )?;
        self.tunnels.insert(target, accepted.clone());
        Ok(accepted)
    }

    fn client_for(&mut self, key: ClientKey, url: &str) -> Result<&Client, FetchError> {
        if !self.clients.contains_key(&key) {
            let client = build_client(&self.options, &key)
                .map_err(|message| FetchError::configuration(format!("{message} (while fetching {url})")))?;
            self.clients.insert(key.clone(), client);
        }
        self.clients
            .get(&key)
            .ok_or_else(|| FetchError::configuration("HTTP client cache is inconsistent"))
    }
}

impl Transport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supports_ssl(&self) -> bool {
        true
    }

    #[instrument(level = "debug", skip(self, request, trust), fields(url = %request.url))]
    fn execute(
        &mut self,
        request: &HttpRequest,
        trust: &TrustAnchor,
    ) -> Result<HttpResponse, FetchError> {
        let url = request.url.as_str();
        let tunnel = self.tunnel_target(&request.url);
        let mut renegotiated = false;
        loop {
            let key = ClientKey {
                trust: if request.url.scheme() == "https" {
                    trust.clone()
                } else {
                    TrustAnchor::Native
                },
                tunnel_auth: self.tunnel_authorization(request)?,
            };
            let sent = self
                .client_for(key.clone(), url)?
                .get(request.url.clone())
                .headers(request.headers.clone())
                .timeout(request.timeout)
                .send();

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let mapped = map_reqwest_error(&request.url, &e);
                    let Some(target) = tunnel.as_ref().filter(|_| tunnel_refused(&e, &mapped)) else {
                        return Err(mapped);
                    };
                    // The remembered credentials went stale; the proxy has to
                    // be asked again.
                    self.tunnels.remove(target);
                    self.clients.remove(&key);
                    let proxy = self.proxy_for(&request.url).unwrap_or_default();
                    if renegotiated {
                        warn!(proxy = %proxy, "proxy refused the tunnel after renegotiation");
                        return Err(FetchError::proxy_auth(
                            &proxy,
                            format!(
                                "proxy {proxy} refused the tunnel to {target}: {}",
                                error_chain(&e)
                            ),
                        ));
                    }
                    debug!(proxy = %proxy, "proxy refused cached tunnel credentials, renegotiating");
                    renegotiated = true;
                    continue;
                }
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .map_err(|e| map_reqwest_error(&request.url, &e))?
                .to_vec();
            debug!(status, bytes = body.len(), "response received");
            return Ok(HttpResponse {
                status,
                headers,
                body,
            });
        }
    }

    fn close(&mut self) {
        self.clients.clear();
        self.tunnels.clear();
    }

    fn proxy_for(&self, url: &Url) -> Option<String> {
        self.options.proxy.for_url(url).map(proxy_label)
    }
}

/// Whether a failed send looks like the proxy turning down the CONNECT.
fn tunnel_refused(error: &reqwest::Error, mapped: &FetchError) -> bool {
    if matches!(mapped, FetchError::Trust { .. }) {
        return false;
    }
    let chain = error_chain(error).to_ascii_lowercase();
    error.is_connect() || chain.contains("407") || chain.contains("proxy authentication")
}

fn build_client(options: &TransportOptions, key: &ClientKey) -> Result<Client, String> {
    let mut builder = Client::builder().no_proxy();

    if let TrustAnchor::Bundle(path) = &key.trust {
        let pem = fs::read(path).map_err(|e| format!("cannot read CA bundle {}: {e}", path.display()))?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| format!("invalid CA bundle {}: {e}", path.display()))?;
        builder = builder.tls_built_in_root_certs(false);
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    let bypass = || NoProxy::from_string(&options.proxy.no_proxy.join(","));
    if let Some(proxy_url) = &options.proxy.http_proxy {
        let mut proxy = Proxy::http(proxy_url.as_str())
            .map_err(|e| format!("invalid http proxy: {e}"))?
            .no_proxy(bypass());
        if let Some(credentials) = &options.proxy.credentials {
            proxy = proxy.basic_auth(&credentials.username, &credentials.password);
        }
        builder = builder.proxy(proxy);
    }
    if let Some(proxy_url) = &options.proxy.https_proxy {
        let mut proxy = Proxy::https(proxy_url.as_str())
            .map_err(|e| format!("invalid https proxy: {e}"))?
            .no_proxy(bypass());
        if let Some(auth) = &key.tunnel_auth {
            let value = HeaderValue::from_str(auth).map_err(|e| format!("invalid proxy credentials: {e}"))?;
            proxy = proxy.custom_http_auth(value);
        }
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| format!("failed to build HTTP client: {e}"))
}

/// Maps a reqwest failure onto the taxonomy by inspecting its cause chain.
fn map_reqwest_error(url: &Url, error: &reqwest::Error) -> FetchError {
    let chain = error_chain(error);
    let lower = chain.to_ascii_lowercase();
    let domain = url.host_str().unwrap_or_default();

    if url.scheme() == "https"
        && ["certificate", "tls", "ssl", "handshake", "x509"]
            .iter()
            .any(|needle| lower.contains(needle))
    {
        return FetchError::trust(domain, format!("TLS validation failed for {url}: {chain}"));
    }
    let kind = if error.is_timeout() {
        NetworkFailure::Timeout
    } else if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
        NetworkFailure::Dns
    } else if error.is_connect() {
        NetworkFailure::Connect
    } else if error.is_request() || error.is_body() || lower.contains("reset") {
        NetworkFailure::Reset
    } else {
        return FetchError::protocol(url.as_str(), None, format!("request to {url} failed: {chain}"));
    };
    FetchError::transient(url.as_str(), kind, format!("{kind} fetching {url}: {chain}"))
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
