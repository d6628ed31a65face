//! CONNECT tunnel negotiation against an HTTP proxy.
//!
//! The handshake is plain HTTP over TCP, so it is driven directly on a
//! [`TcpStream`]. The result is the `Proxy-Authorization` value (if any) that
//! the proxy accepted; the TLS transport then reuses it for its own tunnels.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, instrument, warn};
use url::Url;

use super::{ProxyAuthenticator, parse_challenges, proxy_label};
use crate::download::{FetchError, NetworkFailure, io_failure};

/// Upper bound on a proxy response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Status line and headers of a proxy response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// Header pairs in arrival order, names lowercased.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// All values of header `name`.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Parses `HTTP/1.1 407 ...\r\nName: value\r\n...` into a [`ResponseHead`].
#[must_use]
pub fn parse_response_head(raw: &str) -> Option<ResponseHead> {
    let mut lines = raw.split("\r\n").flat_map(|l| l.split('\n'));
    let status_line = lines.next()?;
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = parts.next()?.parse().ok()?;
    let headers = lines
        .take_while(|l| !l.trim().is_empty())
        .filter_map(|l| {
            let (name, value) = l.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();
    Some(ResponseHead { status, headers })
}

/// Establishes whether a CONNECT to `host:port` through `proxy` succeeds.
///
/// Without a challenge, returns `Ok(None)`. On `407`, answers once with
/// credentials from `authenticator` and returns the accepted header value.
///
/// # Errors
///
/// - [`FetchError::ProxyAuth`] if the proxy demands auth and none is configured,
///   or rejects the computed credentials a second time
/// - [`FetchError::TransientNetwork`] for socket failures
/// - [`FetchError::Protocol`] for any other status or a malformed reply
#[instrument(skip(authenticator, user_agent), fields(proxy = %proxy))]
pub fn negotiate(
    proxy: &Url,
    host: &str,
    port: u16,
    user_agent: &str,
    authenticator: Option<&ProxyAuthenticator>,
    timeout: Duration,
) -> Result<Option<String>, FetchError> {
    let proxy_label = proxy_label(proxy);

    let first = connect_once(proxy, host, port, user_agent, None, timeout)?;
    match first.status {
        200..=299 => return Ok(None),
        407 => {}
        other => return Err(unexpected_status(&proxy_label, host, port, other)),
    }

    let Some(authenticator) = authenticator else {
        return Err(FetchError::proxy_auth(
            &proxy_label,
            format!("proxy {proxy_label} requires authentication but no credentials are configured"),
        ));
    };
    let challenges = parse_challenges(&first.values("proxy-authenticate"));
    let authorization = authenticator.authorization_for(&challenges, host, port, &proxy_label)?;

    let second = connect_once(proxy, host, port, user_agent, Some(&authorization), timeout)?;
    match second.status {
        200..=299 => {
            debug!("proxy accepted credentials");
            Ok(Some(authorization))
        }
        407 => {
            warn!("proxy rejected credentials");
            Err(FetchError::proxy_auth(
                &proxy_label,
                format!("proxy {proxy_label} rejected the supplied credentials"),
            ))
        }
        other => Err(unexpected_status(&proxy_label, host, port, other)),
    }
}

fn unexpected_status(proxy: &str, host: &str, port: u16, status: u16) -> FetchError {
    let target = format!("{host}:{port}");
    let message = format!("proxy {proxy} answered HTTP {status} to CONNECT {target}");
    if status == 503 {
        FetchError::service_unavailable(target, message)
    } else {
        FetchError::protocol(target, Some(status), message)
    }
}

fn connect_once(
    proxy: &Url,
    host: &str,
    port: u16,
    user_agent: &str,
    authorization: Option<&str>,
    timeout: Duration,
) -> Result<ResponseHead, FetchError> {
    let target = proxy.as_str();
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| FetchError::invalid_url(target))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    let addr = (proxy_host, proxy_port)
        .to_socket_addrs()
        .map_err(|e| FetchError::transient(target, NetworkFailure::Dns, e.to_string()))?
        .next()
        .ok_or_else(|| {
            FetchError::transient(target, NetworkFailure::Dns, format!("no address for {proxy_host}"))
        })?;

    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| io_failure(target, &e))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| io_failure(target, &e))?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: {user_agent}\r\n"
    );
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .map_err(|e| io_failure(target, &e))?;

    let raw = read_head(&mut stream).map_err(|e| io_failure(target, &e))?;
    parse_response_head(&raw).ok_or_else(|| {
        FetchError::protocol(target, None, format!("malformed CONNECT response from proxy {target}"))
    })
}

fn read_head(stream: &mut impl Read) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while buf.len() < MAX_HEAD_BYTES {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::proxy::ProxyCredentials;

    #[test]
    fn test_parse_response_head() {
        let head = parse_response_head(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"p\"\r\nProxy-Authenticate: Digest realm=\"p\", nonce=\"n\"\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.status, 407);
        assert_eq!(head.values("Proxy-Authenticate").len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_response_head("SSH-2.0-OpenSSH\r\n\r\n").is_none());
        assert!(parse_response_head("").is_none());
    }

    /// Minimal proxy: answers each accepted connection with the next scripted
    /// reply and records the request head it received.
    fn scripted_proxy(replies: Vec<&'static str>) -> (Url, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        thread::spawn(move || {
            for reply in replies {
                let Ok((mut stream, _)) = listener.accept() else { return };
                let head = read_head(&mut stream).unwrap();
                seen_clone.lock().unwrap().push(head);
                stream.write_all(reply.as_bytes()).unwrap();
            }
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), seen)
    }

    fn authenticator() -> ProxyAuthenticator {
        ProxyAuthenticator::new(ProxyCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        })
    }

    #[test]
    fn test_open_proxy_needs_no_authorization() {
        let (proxy, seen) = scripted_proxy(vec!["HTTP/1.1 200 Connection established\r\n\r\n"]);
        let result = negotiate(&proxy, "example.com", 443, "ua", None, Duration::from_secs(5)).unwrap();
        assert_eq!(result, None);
        assert!(seen.lock().unwrap()[0].starts_with("CONNECT example.com:443 HTTP/1.1"));
    }

    #[test]
    fn test_digest_challenge_answered_once() {
        let (proxy, seen) = scripted_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Digest realm=\"corp\", nonce=\"abc\", qop=\"auth\"\r\nContent-Length: 0\r\n\r\n",
            "HTTP/1.1 200 Connection established\r\n\r\n",
        ]);
        let auth = authenticator();
        let header = negotiate(&proxy, "example.com", 443, "ua", Some(&auth), Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(header.starts_with("Digest "));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].contains("Proxy-Authorization"));
        assert!(seen[1].contains("Proxy-Authorization: Digest "));
    }

    #[test]
    fn test_second_407_is_fatal() {
        let (proxy, _) = scripted_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
        ]);
        let auth = authenticator();
        let err = negotiate(&proxy, "example.com", 443, "ua", Some(&auth), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, FetchError::ProxyAuth { .. }), "{err:?}");
    }

    #[test]
    fn test_407_without_credentials_is_fatal() {
        let (proxy, _) = scripted_proxy(vec![
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
        ]);
        let err = negotiate(&proxy, "example.com", 443, "ua", None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, FetchError::ProxyAuth { .. }));
    }

    #[test]
    fn test_other_status_is_protocol_error() {
        let (proxy, _) = scripted_proxy(vec!["HTTP/1.1 403 Forbidden\r\n\r\n"]);
        let err = negotiate(&proxy, "example.com", 443, "ua", None, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.status(), Some(403));
    }
}
