//! Transport that shells out to `wget`.

use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument};
use url::Url;

use super::{TransportOptions, header_lines, parse_last_response, whole_seconds};
use crate::download::{FetchError, HttpRequest, HttpResponse, NetworkFailure, Transport};
use crate::process::{CommandRunner, ProcessOutput};
use crate::proxy::proxy_label;
use crate::trust::TrustAnchor;

const PROGRAM: &str = "wget";

/// Runs one `wget` process per request.
///
/// `-S` prints the server response to stderr, indented by two spaces; the
/// body goes to stdout. Proxies are handed over through the environment.
#[derive(Debug)]
pub struct WgetTransport {
    options: TransportOptions,
    runner: Arc<dyn CommandRunner>,
    ssl: OnceLock<bool>,
}

impl WgetTransport {
    /// Creates a transport running `wget` through `runner`.
    #[must_use]
    pub fn new(options: TransportOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            options,
            runner,
            ssl: OnceLock::new(),
        }
    }

    /// Uses an already known TLS capability instead of asking `wget --version`.
    #[must_use]
    pub fn with_tls_support(mut self, supported: bool) -> Self {
        self.ssl = OnceLock::from(supported);
        self
    }

    fn arguments(&self, request: &HttpRequest, trust: &TrustAnchor) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-q".into(),
            "-S".into(),
            "-O".into(),
            "-".into(),
            "--tries=1".into(),
            format!("--timeout={}", whole_seconds(request.timeout)),
        ];
        for line in header_lines(&request.headers) {
            args.push(format!("--header={line}"));
        }
        if request.url.scheme() == "https"
            && let TrustAnchor::Bundle(path) = trust
        {
            args.push(format!("--ca-certificate={}", path.display()));
        }
        if self.options.proxy.for_url(&request.url).is_some() {
            if let Some(credentials) = &self.options.proxy.credentials {
                args.push(format!("--proxy-user={}", credentials.username));
                args.push(format!("--proxy-password={}", credentials.password));
            }
        } else {
            args.push("--no-proxy".into());
        }
        args.push(request.url.to_string());
        args
    }

    fn environment(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(proxy) = &self.options.proxy.http_proxy {
            env.push(("http_proxy".to_string(), proxy.to_string()));
        }
        if let Some(proxy) = &self.options.proxy.https_proxy {
            env.push(("https_proxy".to_string(), proxy.to_string()));
        }
        env
    }

    fn map_exit(&self, request: &HttpRequest, output: &ProcessOutput) -> FetchError {
        let url = request.url.as_str();
        let domain = request.url.host_str().unwrap_or_default();
        let code = output.code.unwrap_or(-1);
        let stderr = output.stderr_text();
        let detail = format!("wget exited with {code} fetching {url}: {}", stderr.trim());
        if let Some(proxy) = self.proxy_for(&request.url) {
            let rejected = stderr.contains(" 407 ")
                || stderr.to_ascii_lowercase().contains("proxy authentication required");
            if rejected || (code == 6 && self.options.proxy.credentials.is_some()) {
                return FetchError::proxy_auth(proxy, detail);
            }
        }
        match code {
            4 => FetchError::transient(url, NetworkFailure::Connect, detail),
            5 => FetchError::trust(domain, detail),
            _ => FetchError::protocol(url, None, detail),
        }
    }
}

impl Transport for WgetTransport {
    fn name(&self) -> &'static str {
        PROGRAM
    }

    fn supports_ssl(&self) -> bool {
        *self.ssl.get_or_init(|| {
            let supported = self
                .runner
                .run(PROGRAM, &["--version".to_string()], &[])
                .is_ok_and(|output| has_ssl_feature(&String::from_utf8_lossy(&output.stdout)));
            debug!(supported, "probed wget TLS support");
            supported
        })
    }

    #[instrument(level = "debug", skip(self, request, trust), fields(url = %request.url))]
    fn execute(
        &mut self,
        request: &HttpRequest,
        trust: &TrustAnchor,
    ) -> Result<HttpResponse, FetchError> {
        let url = request.url.as_str();
        let args = self.arguments(request, trust);
        let output = self
            .runner
            .run(PROGRAM, &args, &self.environment())
            .map_err(|e| FetchError::configuration(format!("cannot run wget: {e}")))?;

        let stderr = output.stderr_text();
        let parsed = parse_last_response(stderr.lines().filter(|l| l.starts_with(' ')));

        match (output.code, parsed) {
            // 8 means the server answered with an error status.
            (Some(0 | 8), Some((status, headers))) => Ok(HttpResponse {
                status,
                headers,
                body: output.stdout,
            }),
            (Some(0 | 8), None) => Err(FetchError::protocol(
                url,
                None,
                format!("wget returned no server response for {url}"),
            )),
            _ => Err(self.map_exit(request, &output)),
        }
    }

    fn close(&mut self) {}

    fn proxy_for(&self, url: &Url) -> Option<String> {
        self.options.proxy.for_url(url).map(proxy_label)
    }
}

fn has_ssl_feature(version: &str) -> bool {
    version
        .split_whitespace()
        .any(|feature| feature == "+ssl" || feature == "+https" || feature.starts_with("+ssl/"))
}
