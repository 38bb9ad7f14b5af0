//! Transparent value compression, applied above the storage-backend
//! layer so it is identical regardless of which backend is in use.

use crate::error::{StoreError, StoreResult};

/// Values larger than this many bytes are compressed before handoff to
/// the backend.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;

/// Compress `value` if it is large enough to be worth it, prefixing the
/// result with a one-byte framing flag so [`decode`] knows whether to
/// decompress.
pub fn encode(value: &[u8], compression_enabled: bool) -> StoreResult<Vec<u8>> {
    if compression_enabled && value.len() > COMPRESSION_THRESHOLD {
        let compressed = zstd::encode_all(value, 0)
            .map_err(|e| StoreError::BackendIO(format!("compression failed: {e}")))?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(FLAG_ZSTD);
        out.extend_from_slice(&compressed);
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(value.len() + 1);
        out.push(FLAG_RAW);
        out.extend_from_slice(value);
        Ok(out)
    }
}

/// Reverse of [`encode`].
pub fn decode(framed: &[u8]) -> StoreResult<Vec<u8>> {
    match framed.split_first() {
        Some((&FLAG_RAW, rest)) => Ok(rest.to_vec()),
        Some((&FLAG_ZSTD, rest)) => zstd::decode_all(rest)
            .map_err(|e| StoreError::Corruption(format!("decompression failed: {e}"))),
        Some((flag, _)) => Err(StoreError::Corruption(format!(
            "unknown compression flag {flag}"
        ))),
        None => Err(StoreError::Corruption("empty framed value".into())),
    }
}
