use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use super::Reply;

/// Bodies at or below this size go out uncompressed
const MIN_COMPRESS_LEN: usize = 1000;

/// Compress data using gzip
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    accept_encoding.is_some_and(|value| value.contains("gzip"))
}

/// Compresses the reply body if the client supports gzip and the body is
/// large enough to benefit.
pub fn compress_reply(reply: Reply, accept_encoding: Option<&str>) -> Reply {
    if !accepts_gzip(accept_encoding) || reply.body.len() <= MIN_COMPRESS_LEN {
        return reply;
    }

    match gzip_compress(&reply.body) {
        Ok(compressed) => {
            log::debug!("Compressed {} bytes to {} bytes", reply.body.len(), compressed.len());
            Reply {
                body: compressed,
                ..reply
            }
            .with_header("Content-Encoding", "gzip")
            .with_header("Vary", "Accept-Encoding")
        }
        Err(e) => {
            log::warn!("Compression failed: {}", e);
            reply
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_gzip_compress() {
        let data = "Hello, World! ".repeat(100);
        let compressed = gzip_compress(data.as_bytes()).unwrap();

        assert!(compressed.len() < data.len());
        // Check gzip magic number
        assert_eq!(&compressed[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn large_html_is_compressed_for_gzip_clients() {
        let page = "<p>light</p>".repeat(200);
        let reply = compress_reply(Reply::html(&page), Some("gzip, deflate"));
        assert_eq!(reply.header("Content-Encoding"), Some("gzip"));

        let mut decoded = String::new();
        GzDecoder::new(&reply.body[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn small_or_unsupported_bodies_are_left_alone() {
        let small = compress_reply(Reply::html("<p>hi</p>"), Some("gzip"));
        assert_eq!(small.header("Content-Encoding"), None);

        let page = "x".repeat(5000);
        let plain = compress_reply(Reply::html(&page), None);
        assert_eq!(plain.body.len(), 5000);
    }
}
