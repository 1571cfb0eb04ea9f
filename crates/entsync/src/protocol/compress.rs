// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deflate compression for bulk payloads.
//!
//! Scene snapshots can be large; senders may compress chunk payloads before
//! framing. The compressed form carries the original length as a varint
//! prefix so decompression is bounded up front:
//!
//! ```text
//! compressed = orig_len(varint) | deflate_bytes
//! ```

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::core::error::{NetworkError, Result};

/// Default Deflate level (zlib's balanced setting).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Refuse to decompress payloads declaring more than this (anti-OOM).
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

const MAX_VARINT_LEN: usize = 10;

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(NetworkError::DecompressionFailed(
        "invalid length prefix".into(),
    ))
}

/// Upper bound on the compressed size of `len` input bytes.
///
/// zlib's bound for raw Deflate streams, plus the varint length prefix. No
/// input compresses to more than this.
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + MAX_VARINT_LEN
}

/// Compress `data` at the given Deflate level (clamped to 0..=9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + MAX_VARINT_LEN + 16);
    encode_varint(data.len() as u64, &mut out);
    let mut encoder = DeflateEncoder::new(out, Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| NetworkError::CompressionFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| NetworkError::CompressionFailed(e.to_string()))
}

/// Decompress a payload produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let (orig_len, prefix) = decode_varint(data)?;
    let orig_len = usize::try_from(orig_len)
        .map_err(|_| NetworkError::DecompressionFailed("length prefix overflow".into()))?;
    if orig_len > MAX_DECOMPRESSED_SIZE {
        return Err(NetworkError::DecompressionFailed(format!(
            "declared size {} exceeds maximum {}",
            orig_len, MAX_DECOMPRESSED_SIZE
        )));
    }

    let mut out = Vec::with_capacity(orig_len);
    let mut decoder = DeflateDecoder::new(&data[prefix..]);
    // +1 so a stream longer than declared is detected, not truncated.
    decoder
        .by_ref()
        .take(orig_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| NetworkError::DecompressionFailed(e.to_string()))?;
    if out.len() != orig_len {
        return Err(NetworkError::DecompressionFailed(format!(
            "length mismatch: declared {}, inflated {}",
            orig_len,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_identity() {
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0u8; 1],
            b"hello world".to_vec(),
            vec![0u8; 10_000],
            (0..=255u8).cycle().take(70_000).collect(),
        ];
        for data in inputs {
            let packed = compress(&data, DEFAULT_COMPRESSION_LEVEL).unwrap();
            assert_eq!(decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_round_trip_random_data() {
        fastrand::seed(7);
        for _ in 0..20 {
            let data: Vec<u8> = (0..fastrand::usize(0..4096)).map(|_| fastrand::u8(..)).collect();
            let packed = compress(&data, 3).unwrap();
            assert_eq!(decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_compressed_size_within_bound() {
        fastrand::seed(11);
        for len in [0usize, 1, 64, 1024, 65_536] {
            // Incompressible input is the worst case for the bound.
            let data: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            let packed = compress(&data, 9).unwrap();
            assert!(
                packed.len() <= compress_bound(len),
                "len {}: {} > bound {}",
                len,
                packed.len(),
                compress_bound(len)
            );
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decompress(&[]).is_err());
        // Valid varint prefix, invalid deflate stream.
        let mut bogus = Vec::new();
        encode_varint(100, &mut bogus);
        bogus.extend_from_slice(&[0xFF; 32]);
        assert!(decompress(&bogus).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut packed = compress(b"truthful payload", 6).unwrap();
        // Rewrite the prefix to lie about the original length.
        let (_, prefix) = decode_varint(&packed).unwrap();
        let stream = packed.split_off(prefix);
        let mut lied = Vec::new();
        encode_varint(3, &mut lied);
        lied.extend(stream);
        assert!(matches!(
            decompress(&lied),
            Err(NetworkError::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_oversize_declared_rejected() {
        let mut bogus = Vec::new();
        encode_varint((MAX_DECOMPRESSED_SIZE as u64) + 1, &mut bogus);
        bogus.push(0);
        assert!(decompress(&bogus).is_err());
    }

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let (decoded, used) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }
}
