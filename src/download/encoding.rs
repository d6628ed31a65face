//! `Content-Encoding` decoding for response bodies.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Decodes `body` according to a `Content-Encoding` header value.
///
/// `deflate` is tried as zlib-wrapped first and raw deflate second, since
/// servers disagree on which one the name means. Unknown encodings are an
/// error rather than passing compressed bytes through.
///
/// # Errors
///
/// Returns a description of the failure when the body cannot be decoded.
pub fn decode_body(encoding: Option<&str>, body: Vec<u8>) -> Result<Vec<u8>, String> {
    let Some(encoding) = encoding.map(|e| e.trim().to_ascii_lowercase()) else {
        return Ok(body);
    };

    match encoding.as_str() {
        "" | "identity" => Ok(body),
        "gzip" | "x-gzip" => {
            read_all(GzDecoder::new(body.as_slice())).map_err(|e| format!("invalid gzip body: {e}"))
        }
        "deflate" => read_all(ZlibDecoder::new(body.as_slice()))
            .or_else(|_| read_all(DeflateDecoder::new(body.as_slice())))
            .map_err(|e| format!("invalid deflate body: {e}")),
        other => Err(format!("unsupported content encoding '{other}'")),
    }
}

fn read_all(mut reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
