//! RFC 2617 Digest computation.
//!
//! Everything here is pure: no clock, no randomness, no sockets. The caller
//! supplies the client nonce so reference vectors can be checked directly.

use sha1::{Digest as _, Sha1};

/// Hash function advertised by the server's `algorithm` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// `MD5` (the default when no algorithm is advertised).
    Md5,
    /// `SHA` / `SHA-1`.
    Sha1,
}

impl DigestAlgorithm {
    /// Parses the `algorithm` challenge parameter.
    ///
    /// Returns `None` for algorithms this client cannot compute (e.g. `MD5-sess`).
    #[must_use]
    pub fn from_challenge(value: Option<&str>) -> Option<Self> {
        match value.map(str::to_ascii_uppercase).as_deref() {
            None | Some("MD5") => Some(Self::Md5),
            Some("SHA" | "SHA1" | "SHA-1") => Some(Self::Sha1),
            Some(_) => None,
        }
    }

    /// Lowercase hex digest of `input`.
    #[must_use]
    pub fn hash(self, input: &str) -> String {
        match self {
            Self::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
            Self::Sha1 => hex::encode(Sha1::digest(input.as_bytes())),
        }
    }
}

/// Fixed nonce count; each header is computed for a single request.
pub const NONCE_COUNT: &str = "00000001";

/// Inputs that determine a digest response.
#[derive(Debug, Clone)]
pub struct DigestInput<'a> {
    /// Account name.
    pub username: &'a str,
    /// Account password.
    pub password: &'a str,
    /// Challenge realm.
    pub realm: &'a str,
    /// Server nonce.
    pub nonce: &'a str,
    /// Request method (`CONNECT` for tunnels).
    pub method: &'a str,
    /// Digest URI (`host:port` for tunnels).
    pub uri: &'a str,
    /// `Some("auth")` when quality of protection is in use.
    pub qop: Option<&'a str>,
    /// Client nonce, used only with `qop`.
    pub cnonce: &'a str,
    /// Hash function.
    pub algorithm: DigestAlgorithm,
}

/// Computes the `response` parameter of a Digest authorization.
#[must_use]
pub fn digest_response(input: &DigestInput<'_>) -> String {
    let h = |s: &str| input.algorithm.hash(s);
    let ha1 = h(&format!("{}:{}:{}", input.username, input.realm, input.password));
    let ha2 = h(&format!("{}:{}", input.method, input.uri));
    match input.qop {
        Some(qop) => h(&format!(
            "{ha1}:{}:{NONCE_COUNT}:{}:{qop}:{ha2}",
            input.nonce, input.cnonce
        )),
        None => h(&format!("{ha1}:{}:{ha2}", input.nonce)),
    }
}

/// Assembles the full `Digest ...` credentials string.
///
/// `algorithm_name` echoes the server's spelling and is only included when
/// the server advertised one; `opaque` is echoed verbatim.
#[must_use]
pub fn digest_authorization(
    input: &DigestInput<'_>,
    algorithm_name: Option<&str>,
    opaque: Option<&str>,
) -> String {
    let response = digest_response(input);
    let mut fields = vec![
        format!("username=\"{}\"", input.username),
        format!("realm=\"{}\"", input.realm),
        format!("nonce=\"{}\"", input.nonce),
        format!("uri=\"{}\"", input.uri),
        format!("response=\"{response}\""),
    ];
    if let Some(name) = algorithm_name {
        fields.push(format!("algorithm={name}"));
    }
    if let Some(qop) = input.qop {
        fields.push(format!("qop={qop}"));
        fields.push(format!("nc={NONCE_COUNT}"));
        fields.push(format!("cnonce=\"{}\"", input.cnonce));
    }
    if let Some(opaque) = opaque {
        fields.push(format!("opaque=\"{opaque}\""));
    }
    format!("Digest {}", fields.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc2617_input(qop: Option<&'static str>) -> DigestInput<'static> {
        DigestInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            method: "GET",
            uri: "/dir/index.html",
            qop,
            cnonce: "0a4f113b",
            algorithm: DigestAlgorithm::Md5,
        }
    }

    #[test]
    fn test_rfc2617_reference_vector_with_qop_auth() {
        assert_eq!(
            digest_response(&rfc2617_input(Some("auth"))),
            "6629fae49393a05397450978507c4ef1"
        );
    }

    #[test]
    fn test_response_without_qop_uses_short_form() {
        let input = rfc2617_input(None);
        let ha1 = DigestAlgorithm::Md5.hash("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = DigestAlgorithm::Md5.hash("GET:/dir/index.html");
        let expected =
            DigestAlgorithm::Md5.hash(&format!("{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{ha2}"));
        assert_eq!(digest_response(&input), expected);
    }

    #[test]
    fn test_known_hashes() {
        assert_eq!(
            DigestAlgorithm::Md5.hash("abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            DigestAlgorithm::Sha1.hash("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_sha1_changes_response() {
        let mut input = rfc2617_input(Some("auth"));
        input.algorithm = DigestAlgorithm::Sha1;
        let response = digest_response(&input);
        assert_eq!(response.len(), 40);
        assert_ne!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(DigestAlgorithm::from_challenge(None), Some(DigestAlgorithm::Md5));
        assert_eq!(
            DigestAlgorithm::from_challenge(Some("md5")),
            Some(DigestAlgorithm::Md5)
        );
        assert_eq!(
            DigestAlgorithm::from_challenge(Some("SHA")),
            Some(DigestAlgorithm::Sha1)
        );
        assert_eq!(DigestAlgorithm::from_challenge(Some("MD5-sess")), None);
    }

    #[test]
    fn test_authorization_header_fields() {
        let header = digest_authorization(
            &rfc2617_input(Some("auth")),
            Some("MD5"),
            Some("5ccc069c403ebaf9f0171e9517f40e41"),
        );
        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("cnonce=\"0a4f113b\""));
        assert!(header.contains("algorithm=MD5"));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_authorization_header_without_qop_omits_nc_and_cnonce() {
        let header = digest_authorization(&rfc2617_input(None), None, None);
        assert!(!header.contains("nc="));
        assert!(!header.contains("cnonce="));
        assert!(!header.contains("algorithm="));
        assert!(!header.contains("opaque="));
    }
}
