//! Snappy value compression. Only the value section is ever compressed;
//! keys and extras travel as-is.

use bytes::Bytes;

/// The minimum input length before compression is even attempted.
pub const MIN_COMPRESSIBLE_LENGTH: usize = 32;

/// A compressed payload must be no larger than this fraction of the
/// original to be worth sending; otherwise the raw bytes go out instead.
const MAX_COMPRESSED_RATIO: f64 = 0.83;

/// Compress `value` if it clears both the size threshold and the
/// compression-ratio gate. Returns `None` when compression isn't worth
/// it, in which case the caller sends `value` uncompressed.
pub fn try_compress(value: &[u8]) -> Option<Vec<u8>> {
    if value.len() < MIN_COMPRESSIBLE_LENGTH {
        return None;
    }
    let compressed = snap::raw::Encoder::new().compress_vec(value).ok()?;
    let limit = (value.len() as f64 * MAX_COMPRESSED_RATIO) as usize;
    if compressed.len() <= limit {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a Snappy-flagged value section. A malformed payload is
/// treated as empty rather than panicking; the caller's higher-level
/// decode will surface this as a protocol error via checksum/length
/// mismatches downstream.
pub fn decompress(compressed: &[u8]) -> Bytes {
    match snap::raw::Decoder::new().decompress_vec(compressed) {
        Ok(raw) => Bytes::from(raw),
        Err(err) => {
            tracing::warn!(error = %err, "failed to decompress snappy value, treating as empty");
            Bytes::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_is_never_compressed() {
        assert_eq!(try_compress(b"short"), None);
    }

    #[test]
    fn highly_compressible_value_round_trips() {
        let value = vec![b'a'; 256];
        let compressed = try_compress(&value).expect("should compress well");
        assert!(compressed.len() < value.len());
        let restored = decompress(&compressed);
        assert_eq!(&restored[..], &value[..]);
    }

    #[test]
    fn incompressible_value_is_rejected_by_the_ratio_gate() {
        // Pseudo-random bytes Snappy can't shrink past the 83% gate.
        let value: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) % 256) as u8).collect();
        assert_eq!(try_compress(&value), None);
    }
}
