//! Upstream response body decompression (§4.5). `reqwest` is built
//! without its own gzip/brotli/deflate features here (those pull in an
//! extra decode pass the crate doesn't need for streamed SSE bodies,
//! which are never compressed in practice); non-streaming JSON bodies
//! still need manual decoding when an upstream sets `Content-Encoding`.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};

pub fn decode(content_encoding: Option<&str>, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    match content_encoding {
        Some("gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            DeflateDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some("br") => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut std::io::Cursor::new(body), &mut out)
                .map_err(|e| anyhow::anyhow!("brotli decode failed: {e}"))?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passthrough_when_no_encoding() {
        let out = decode(None, b"{\"a\":1}").unwrap();
        assert_eq!(out, b"{\"a\":1}");
    }

    #[test]
    fn decodes_gzip_body() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello").unwrap();
        let compressed = encoder.finish().unwrap();

        let out = decode(Some("gzip"), &compressed).unwrap();
        assert_eq!(out, b"hello");
    }
}
