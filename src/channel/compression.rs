//! Gzip compression for the PTY fast lane.
//!
//! Unlike a marker-byte wire format, the PTY content type carries its own
//! `flags` byte (see [`crate::codec`]) whose `0x01` bit says whether the
//! payload that follows is gzip-compressed. These helpers operate on raw
//! payload bytes with no prefix; the caller is responsible for setting
//! and reading the flag bit.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::TransportError;

/// Gzip-compress `data` if it's at or above `threshold`, returning
/// `(bytes, compressed)`. Falls back to the original bytes, uncompressed,
/// if compression doesn't actually shrink the payload.
///
/// # Errors
///
/// Returns `TransportError::EncryptionFailed` if gzip encoding fails.
/// Gzip failures occur writing to memory, so in practice this is
/// unreachable, but the encoder's `Write` impl is fallible.
pub fn maybe_compress(data: &[u8], threshold: usize) -> Result<(Vec<u8>, bool), TransportError> {
    if data.len() < threshold {
        return Ok((data.to_vec(), false));
    }

    let mut compressed = Vec::with_capacity(data.len());
    {
        let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| TransportError::EncryptionFailed(format!("gzip write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| TransportError::EncryptionFailed(format!("gzip finish failed: {e}")))?;
    }

    if compressed.len() < data.len() {
        Ok((compressed, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

/// Gzip-decompress `data`. Callers pass `compressed = false` for payloads
/// whose flag bit was unset, which returns the bytes unchanged.
///
/// # Errors
///
/// Returns `TransportError::EncryptionFailed` if `compressed` is true and
/// `data` is not valid gzip.
pub fn maybe_decompress(data: &[u8], compressed: bool) -> Result<Vec<u8>, TransportError> {
    if !compressed {
        return Ok(data.to_vec());
    }

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| TransportError::EncryptionFailed(format!("gzip decompress failed: {e}")))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_is_not_compressed() {
        let data = b"hello world";
        let (out, compressed) = maybe_compress(data, 1000).expect("compress");
        assert!(!compressed);
        assert_eq!(out, data);
    }

    #[test]
    fn above_threshold_round_trips() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let (out, compressed) = maybe_compress(&data, 100).expect("compress");
        assert!(compressed);
        assert!(out.len() < data.len());

        let decompressed = maybe_decompress(&out, compressed).expect("decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn incompressible_data_falls_back_to_uncompressed() {
        let data = b"\x01\x02\x03\x04\x05\x06\x07\x08";
        let (out, compressed) = maybe_compress(data, 0).expect("compress");
        if compressed {
            let decompressed = maybe_decompress(&out, compressed).expect("decompress");
            assert_eq!(decompressed, data);
        } else {
            assert_eq!(out, data);
        }
    }
}
