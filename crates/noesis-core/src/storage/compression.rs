//! Selective compression policy (§4.1): any tier storing free-text blobs
//! >= `threshold_bytes` may be compressed, but only if the compressed form is
//! strictly smaller than the original. A single leading marker byte
//! distinguishes compressed from raw payloads on read.
//!
//! Grounded on `flate2`'s use elsewhere in the pack (surrealdb-surrealdb,
//! offline-intelligence manifests both reach for it for the same purpose).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::CompressionConfig;
use crate::error::{StorageError, StorageResult};

const MARKER_RAW: u8 = 0;
const MARKER_GZIP: u8 = 1;

/// Compress `payload` per `config`, prefixing a marker byte. Falls through to
/// a raw-marked payload if compression wouldn't shrink it, or if `payload` is
/// below `config.threshold_bytes`.
pub fn encode(payload: &[u8], config: &CompressionConfig) -> StorageResult<Vec<u8>> {
    if !config.enabled || payload.len() < config.threshold_bytes {
        return Ok(raw(payload));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| StorageError::Backend(format!("compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| StorageError::Backend(format!("compression failed: {e}")))?;

    if compressed.len() < payload.len() {
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(MARKER_GZIP);
        out.extend_from_slice(&compressed);
        Ok(out)
    } else {
        Ok(raw(payload))
    }
}

fn raw(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(MARKER_RAW);
    out.extend_from_slice(payload);
    out
}

/// Inverts [`encode`], transparent to the marker byte.
pub fn decode(blob: &[u8]) -> StorageResult<Vec<u8>> {
    match blob.split_first() {
        None => Ok(Vec::new()),
        Some((&MARKER_RAW, rest)) => Ok(rest.to_vec()),
        Some((&MARKER_GZIP, rest)) => {
            let mut decoder = GzDecoder::new(rest);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| StorageError::Backend(format!("decompression failed: {e}")))?;
            Ok(out)
        }
        Some((marker, _)) => Err(StorageError::Backend(format!(
            "unknown compression marker: {marker}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_stays_raw() {
        let config = CompressionConfig {
            enabled: true,
            threshold_bytes: 1024,
            ..Default::default()
        };
        let payload = b"short";
        let encoded = encode(payload, &config).unwrap();
        assert_eq!(encoded[0], MARKER_RAW);
        assert_eq!(decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn large_compressible_payload_round_trips() {
        let config = CompressionConfig {
            enabled: true,
            threshold_bytes: 16,
            ..Default::default()
        };
        let payload = "the quick brown fox ".repeat(200);
        let encoded = encode(payload.as_bytes(), &config).unwrap();
        assert_eq!(encoded[0], MARKER_GZIP);
        assert!(encoded.len() < payload.len());
        assert_eq!(decode(&encoded).unwrap(), payload.as_bytes());
    }

    #[test]
    fn incompressible_payload_falls_back_to_raw() {
        let config = CompressionConfig {
            enabled: true,
            threshold_bytes: 1,
            ..Default::default()
        };
        // Random-looking bytes that gzip can't shrink below original + header.
        let payload: Vec<u8> = (0..64u32).map(|i| (i * 97 % 251) as u8).collect();
        let encoded = encode(&payload, &config).unwrap();
        assert_eq!(decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn disabled_config_never_compresses() {
        let config = CompressionConfig {
            enabled: false,
            threshold_bytes: 1,
            ..Default::default()
        };
        let payload = "the quick brown fox ".repeat(200);
        let encoded = encode(payload.as_bytes(), &config).unwrap();
        assert_eq!(encoded[0], MARKER_RAW);
    }
}
