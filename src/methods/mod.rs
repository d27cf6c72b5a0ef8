//! The compression method library shared by the archive formats (spec
//! §4.8): each decoder takes a read-only compressed buffer and an expected
//! output length and produces decompressed bytes via a pull-style `fill`.

pub mod arsenic;
pub mod lzw;
pub mod method13;
pub mod rle90;
pub mod sit13_tables;

use crate::error::{MunboxError, Result};

/// A decoded method output, already fully materialized in memory. Every
/// method in this family is cheap enough, and every caller already holds
/// the whole compressed fork in memory (archive layers buffer at
/// construction per spec §3), so there is no benefit to a trait object
/// here over a plain enum of ready buffers.
pub enum Method {
    Copy(Vec<u8>),
    Rle90(Vec<u8>),
    Lzw(Vec<u8>),
    LzssHuffman(Vec<u8>),
    Arsenic(Vec<u8>),
}

/// Decode `compressed` using SIT method number `method`, for a fork whose
/// decompressed length is expected to be `expected_len` bytes.
pub fn decode_sit_method(method: u8, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match method {
        0 => Ok(compressed.to_vec()),
        1 => decode_rle90(compressed, expected_len),
        2 => decode_lzw(compressed, expected_len),
        13 => decode_method13(compressed, expected_len),
        15 => decode_arsenic(compressed, expected_len),
        other => Err(MunboxError::UnsupportedFeature(format!(
            "SIT compression method {other} is not supported"
        ))),
    }
}

fn decode_rle90(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let mut decoder = rle90::Rle90Decoder::new(0x90);
    let mut out = vec![0u8; expected_len];
    let mut produced = 0usize;
    while produced < expected_len {
        let n = decoder.fill(
            || {
                if pos < compressed.len() {
                    let b = compressed[pos];
                    pos += 1;
                    Ok(Some(b))
                } else {
                    Ok(None)
                }
            },
            &mut out[produced..],
        )?;
        if n == 0 {
            break;
        }
        produced += n;
    }
    out.truncate(produced);
    Ok(out)
}

fn decode_lzw(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = lzw::LzwDecoder::new(compressed);
    let mut out = vec![0u8; expected_len];
    let mut produced = 0usize;
    while produced < expected_len {
        let n = decoder.fill(&mut out[produced..])?;
        if n == 0 {
            break;
        }
        produced += n;
    }
    out.truncate(produced);
    Ok(out)
}

fn decode_method13(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = method13::Method13Decoder::new(compressed)?;
    let mut out = vec![0u8; expected_len];
    let mut produced = 0usize;
    while produced < expected_len {
        let n = decoder.fill(&mut out[produced..])?;
        if n == 0 {
            break;
        }
        produced += n;
    }
    out.truncate(produced);
    Ok(out)
}

fn decode_arsenic(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = arsenic::ArsenicDecoder::new(compressed)?;
    let mut out = vec![0u8; expected_len];
    let mut produced = 0usize;
    while produced < expected_len {
        let n = decoder.fill(&mut out[produced..])?;
        if n == 0 {
            break;
        }
        produced += n;
    }
    out.truncate(produced);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_zero_is_plain_copy() {
        let out = decode_sit_method(0, b"hello", 5).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn unknown_method_is_unsupported_feature() {
        let err = decode_sit_method(99, b"", 0).unwrap_err();
        assert!(matches!(err, MunboxError::UnsupportedFeature(_)));
    }
}
