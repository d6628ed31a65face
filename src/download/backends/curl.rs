//! Transport that shells out to `curl`.

use std::fs;
use std::sync::{Arc, OnceLock};

use tracing::{debug, instrument};
use url::Url;

use super::{TransportOptions, header_lines, parse_last_response};
use crate::download::{FetchError, HttpRequest, HttpResponse, NetworkFailure, Transport};
use crate::process::{CommandRunner, ProcessOutput};
use crate::proxy::proxy_label;
use crate::trust::TrustAnchor;

const PROGRAM: &str = "curl";

/// Runs one `curl` process per request.
///
/// Response headers are written with `--dump-header` into a temporary file;
/// the body arrives on stdout, still content-encoded.
#[derive(Debug)]
pub struct CurlTransport {
    options: TransportOptions,
    runner: Arc<dyn CommandRunner>,
    ssl: OnceLock<bool>,
}

impl CurlTransport {
    /// Creates a transport running `curl` through `runner`.
    #[must_use]
    pub fn new(options: TransportOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            options,
            runner,
            ssl: OnceLock::new(),
        }
    }

    /// Uses an already known TLS capability instead of asking `curl --version`.
    #[must_use]
    pub fn with_tls_support(mut self, supported: bool) -> Self {
        self.ssl = OnceLock::from(supported);
        self
    }

    fn arguments(&self, request: &HttpRequest, trust: &TrustAnchor, header_path: &str) -> Vec<String> {
        let timeout = format!("{:.3}", request.timeout.as_secs_f64());
        let mut args: Vec<String> = vec![
            "--silent".into(),
            "--show-error".into(),
            "--location".into(),
            "--max-time".into(),
            timeout.clone(),
            "--connect-timeout".into(),
            timeout,
            "--dump-header".into(),
            header_path.to_string(),
        ];
        for line in header_lines(&request.headers) {
            args.push("--header".into());
            args.push(line);
        }

        if request.url.scheme() == "https"
            && let TrustAnchor::Bundle(path) = trust
        {
            args.push("--cacert".into());
            args.push(path.display().to_string());
        }

        if let Some(proxy) = self.options.proxy.for_url(&request.url) {
            args.push("--proxy".into());
            args.push(proxy.to_string());
            if let Some(credentials) = &self.options.proxy.credentials {
                args.push("--proxy-anyauth".into());
                args.push("--proxy-user".into());
                args.push(format!("{}:{}", credentials.username, credentials.password));
            }
        } else {
            args.push("--noproxy".into());
            args.push("*".into());
        }

        args.push(request.url.to_string());
        args
    }
}

impl Transport for CurlTransport {
    fn name(&self) -> &'static str {
        PROGRAM
    }

    fn supports_ssl(&self) -> bool {
        *self.ssl.get_or_init(|| {
            let supported = self
                .runner
                .run(PROGRAM, &["--version".to_string()], &[])
                .is_ok_and(|output| lists_https(&String::from_utf8_lossy(&output.stdout)));
            debug!(supported, "probed curl TLS support");
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
        let header_file = tempfile::NamedTempFile::new()
            .map_err(|e| FetchError::configuration(format!("cannot create header dump file: {e}")))?;
        let header_path = header_file.path().display().to_string();
        let args = self.arguments(request, trust, &header_path);

        let output = self
            .runner
            .run(PROGRAM, &args, &[])
            .map_err(|e| FetchError::configuration(format!("cannot run curl: {e}")))?;
        if !output.success() {
            let proxy = self.proxy_for(&request.url);
            return Err(map_exit(
                url,
                request.url.host_str().unwrap_or_default(),
                proxy.as_deref(),
                &output,
            ));
        }

        let dump = fs::read_to_string(header_file.path()).unwrap_or_default();
        let (status, headers) = parse_last_response(dump.lines()).ok_or_else(|| {
            FetchError::protocol(url, None, format!("curl returned no response headers for {url}"))
        })?;
        Ok(HttpResponse {
            status,
            headers,
            body: output.stdout,
        })
    }

    fn close(&mut self) {}

    fn proxy_for(&self, url: &Url) -> Option<String> {
        self.options.proxy.for_url(url).map(proxy_label)
    }
}

fn lists_https(version: &str) -> bool {
    version
        .lines()
        .filter_map(|line| line.strip_prefix("Protocols:"))
        .any(|protocols| protocols.split_whitespace().any(|p| p == "https"))
}

/// Maps a curl exit code onto the taxonomy.
///
/// A CONNECT answered with 407 surfaces as exit 56, so stderr is checked
/// before the code is treated as a dropped connection.
fn map_exit(url: &str, domain: &str, proxy: Option<&str>, output: &ProcessOutput) -> FetchError {
    let code = output.code.unwrap_or(-1);
    let stderr = output.stderr_text();
    let detail = format!("curl exited with {code} fetching {url}: {}", stderr.trim());
    if let Some(proxy) = proxy
        && tunnel_rejected(&stderr)
    {
        return FetchError::proxy_auth(proxy, detail);
    }
    let transient = |kind| FetchError::transient(url, kind, detail.clone());
    match code {
        6 => transient(NetworkFailure::Dns),
        7 => transient(NetworkFailure::Connect),
        28 => transient(NetworkFailure::Timeout),
        52 | 55 | 56 => transient(NetworkFailure::Reset),
        35 | 51 | 58 | 60 | 77 | 83 => FetchError::trust(domain, detail),
        _ => FetchError::protocol(url, None, detail),
    }
}

fn tunnel_rejected(stderr: &str) -> bool {
    stderr.contains("response 407")
        || stderr.contains(" 407 ")
        || stderr.to_ascii_lowercase().contains("proxy authentication required")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

    use crate::process::testing::ScriptedRunner;
    use crate::proxy::{ProxyCredentials, ProxySettings};

    fn request(url: &str) -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pkgfetch-test"));
        HttpRequest {
            url: Url::parse(url).unwrap(),
            headers,
            timeout: Duration::from_secs(7),
        }
    }

    /// Runner whose hook writes `dump` into the `--dump-header` path.
    fn runner_writing(dump: &'static str) -> ScriptedRunner {
        let mut runner = ScriptedRunner::new(&["curl"]);
        runner.on_run = Some(Box::new(move |args: &[String]| {
            if let Some(pos) = args.iter().position(|a| a == "--dump-header") {
                fs::write(&args[pos + 1], dump).unwrap();
            }
        }));
        runner
    }

    #[test]
    fn test_success_parses_headers_and_body() {
        let runner = Arc::new(runner_writing(
            "HTTP/1.1 200 OK\r\nETag: \"e1\"\r\nContent-Type: application/json\r\n\r\n",
        ));
        runner.push(ProcessOutput {
            code: Some(0),
            stdout: b"{}".to_vec(),
            stderr: Vec::new(),
        });
        let mut transport = CurlTransport::new(TransportOptions::default(), runner.clone());

        let response = transport
            .execute(&request("http://packages.test/a.json"), &TrustAnchor::Native)
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("etag"), Some("\"e1\""));
        assert_eq!(response.body, b"{}");

        let call = &runner.calls()[0];
        assert_eq!(call.program, "curl");
        assert!(call.args.contains(&"User-Agent: pkgfetch-test".to_string()));
        assert!(!call.args.contains(&"--compressed".to_string()));
        assert_eq!(call.args.last().unwrap(), "http://packages.test/a.json");
    }

    #[test]
    fn test_bundle_and_proxy_arguments() {
        let runner = Arc::new(runner_writing("HTTP/2 200\r\n\r\n"));
        runner.push(ProcessOutput {
            code: Some(0),
            ..ProcessOutput::default()
        });
        let options = TransportOptions {
            proxy: ProxySettings {
                http_proxy: None,
                https_proxy: Some(Url::parse("http://proxy.test:3128").unwrap()),
                credentials: Some(ProxyCredentials {
                    username: "alice".into(),
                    password: "s3cret".into(),
                }),
                no_proxy: Vec::new(),
            },
            user_agent: "test".into(),
        };
        let mut transport = CurlTransport::new(options, runner.clone());
        transport
            .execute(
                &request("https://secure.test/x"),
                &TrustAnchor::Bundle("/data/ca-bundle.crt".into()),
            )
            .unwrap();

        let args = runner.calls()[0].args.join(" ");
        assert!(args.contains("--cacert /data/ca-bundle.crt"), "{args}");
        assert!(args.contains("--proxy http://proxy.test:3128/"), "{args}");
        assert!(args.contains("--proxy-anyauth --proxy-user alice:s3cret"), "{args}");
    }

    #[test]
    fn test_http_error_status_is_a_response() {
        let runner = Arc::new(runner_writing("HTTP/1.1 503 Service Unavailable\r\n\r\n"));
        runner.push(ProcessOutput {
            code: Some(0),
            ..ProcessOutput::default()
        });
        let mut transport = CurlTransport::new(TransportOptions::default(), runner);
        let response = transport
            .execute(&request("http://packages.test/a"), &TrustAnchor::Native)
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[test]
    fn test_exit_codes_map_to_taxonomy() {
        let cases = [
            (6, "transient"),
            (7, "transient"),
            (28, "transient"),
            (56, "transient"),
            (60, "trust"),
            (35, "trust"),
            (3, "protocol"),
        ];
        for (code, expected) in cases {
            let output = ProcessOutput {
                code: Some(code),
                stdout: Vec::new(),
                stderr: b"curl: (x) failure".to_vec(),
            };
            let err = map_exit("https://h.test/", "h.test", Some("proxy.test:3128"), &output);
            let actual = match err {
                FetchError::TransientNetwork { .. } => "transient",
                FetchError::Trust { .. } => "trust",
                FetchError::Protocol { .. } => "protocol",
                _ => "other",
            };
            assert_eq!(actual, expected, "exit code {code}");
        }
    }

    #[test]
    fn test_tunnel_407_is_proxy_auth_not_reset() {
        let output = ProcessOutput {
            code: Some(56),
            stdout: Vec::new(),
            stderr: b"curl: (56) CONNECT tunnel failed, response 407\n".to_vec(),
        };
        let err = map_exit("https://h.test/", "h.test", Some("proxy.test:3128"), &output);
        match err {
            FetchError::ProxyAuth { proxy, .. } => assert_eq!(proxy, "proxy.test:3128"),
            other => panic!("expected proxy auth, got {other:?}"),
        }

        let direct = map_exit("https://h.test/", "h.test", None, &output);
        assert!(matches!(direct, FetchError::TransientNetwork { .. }));
    }

    #[test]
    fn test_tunnel_407_through_execute() {
        let runner = Arc::new(ScriptedRunner::new(&["curl"]));
        runner.push(ProcessOutput {
            code: Some(56),
            stdout: Vec::new(),
            stderr: b"curl: (56) CONNECT tunnel failed, response 407".to_vec(),
        });
        let options = TransportOptions {
            proxy: ProxySettings {
                https_proxy: Some(Url::parse("http://proxy.test:3128").unwrap()),
                ..ProxySettings::default()
            },
            user_agent: "test".into(),
        };
        let mut transport = CurlTransport::new(options, runner);
        let err = transport
            .execute(&request("https://secure.test/x"), &TrustAnchor::Native)
            .unwrap_err();
        assert!(matches!(err, FetchError::ProxyAuth { .. }), "{err:?}");
        assert_eq!(err.status(), Some(407));
    }

    #[test]
    fn test_no_proxy_host_bypasses_proxy() {
        let runner = Arc::new(runner_writing("HTTP/1.1 200 OK\r\n\r\n"));
        runner.push(ProcessOutput {
            code: Some(0),
            ..ProcessOutput::default()
        });
        let options = TransportOptions {
            proxy: ProxySettings {
                http_proxy: Some(Url::parse("http://proxy.test:3128").unwrap()),
                no_proxy: vec![".internal.test".into()],
                ..ProxySettings::default()
            },
            user_agent: "test".into(),
        };
        let mut transport = CurlTransport::new(options, runner.clone());
        transport
            .execute(&request("http://mirror.internal.test/a"), &TrustAnchor::Native)
            .unwrap();
        let args = runner.calls()[0].args.join(" ");
        assert!(!args.contains("--proxy "), "{args}");
        assert!(args.contains("--noproxy *"), "{args}");
    }

    #[test]
    fn test_preset_tls_support_skips_version_check() {
        let runner = Arc::new(ScriptedRunner::new(&["curl"]));
        let transport =
            CurlTransport::new(TransportOptions::default(), runner.clone()).with_tls_support(true);
        assert!(transport.supports_ssl());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_ssl_support_detected_from_version() {
        let runner = Arc::new(ScriptedRunner::new(&["curl"]));
        runner.push(ProcessOutput {
            code: Some(0),
            stdout: b"curl 8.5.0\nProtocols: dict file ftp http https imap\nFeatures: SSL\n".to_vec(),
            stderr: Vec::new(),
        });
        let transport = CurlTransport::new(TransportOptions::default(), runner.clone());
        assert!(transport.supports_ssl());
        assert!(transport.supports_ssl());
        assert_eq!(runner.calls().len(), 1, "version probed once");
    }

    #[test]
    fn test_curl_without_https_protocol() {
        assert!(!lists_https("curl 7.0\nProtocols: dict file ftp http\n"));
    }
}
