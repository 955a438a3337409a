//! Body transcoding: chunked transfer-encoding and gzip content-encoding.

use crate::error::ReplacerError;
use crate::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| p + from)
}

/// Decode a chunked body. Chunk extensions and trailers are discarded.
pub fn chunked_decode(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;

    while pos < body.len() {
        let line_end = find_crlf(body, pos)
            .ok_or_else(|| ReplacerError::Decode("chunk size line not terminated".to_string()))?;
        let line = String::from_utf8_lossy(&body[pos..line_end]);
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ReplacerError::Decode(format!("invalid chunk size: {:?}", size_str)))?;
        pos = line_end + 2;

        if size == 0 {
            return Ok(out);
        }

        let end = pos
            .checked_add(size)
            .filter(|end| *end <= body.len())
            .ok_or_else(|| ReplacerError::Decode("chunk exceeds body length".to_string()))?;
        out.extend_from_slice(&body[pos..end]);
        pos = end;

        // each chunk's data is followed by CRLF
        if body.get(pos..pos + 2) == Some(b"\r\n".as_slice()) {
            pos += 2;
        } else if pos < body.len() {
            return Err(ReplacerError::Decode("chunk data not terminated".to_string()));
        }
    }

    Ok(out)
}

/// Encode a body as a single chunk followed by the terminating chunk
pub fn chunked_encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

pub fn gzip_decompress(body: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ReplacerError::Decode(format!("gzip: {}", e)))?;
    Ok(out)
}

pub fn gzip_compress(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}
