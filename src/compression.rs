//! LZ4 codec for the persisted snapshot chain
//!
//! The chain is stored as one compressed blob, both on disk and inside every
//! archive. The layout is a 4-byte magic header followed by the output of
//! [`lz4_flex::compress_prepend_size`]:
//!
//! ```text
//! +------+---------------+---------------------+
//! | SNC1 | u32 LE length | LZ4 block (JSON)    |
//! +------+---------------+---------------------+
//! ```
//!
//! The magic makes it cheap to reject files that are not chains (an empty
//! file, a stray archive) before handing bytes to the decompressor.
//!
//! ## Examples
//!
//! ```rust
//! use snapsync::compression::{decode, encode};
//!
//! let blob = encode(br#"{"snapshots":[]}"#);
//! assert_eq!(&blob[..4], b"SNC1");
//! assert_eq!(decode(&blob).unwrap(), br#"{"snapshots":[]}"#);
//! ```

use crate::error::{Result, SyncError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::time::Instant;
use tracing::{debug, trace};

/// Magic header of an encoded chain
pub const CHAIN_MAGIC: &[u8; 4] = b"SNC1";

/// Compress `data` and prefix it with [`CHAIN_MAGIC`]
pub fn encode(data: &[u8]) -> Vec<u8> {
    let start = Instant::now();
    let compressed = compress_prepend_size(data);

    let mut out = Vec::with_capacity(CHAIN_MAGIC.len() + compressed.len());
    out.extend_from_slice(CHAIN_MAGIC);
    out.extend_from_slice(&compressed);

    debug!(
        "Encoded chain: {} -> {} bytes in {:?}",
        data.len(),
        out.len(),
        start.elapsed()
    );
    out
}

/// Verify the header and decompress a blob produced by [`encode`]
///
/// # Errors
///
/// - [`SyncError::Codec`] if the header is missing or the LZ4 block is
///   truncated or malformed
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    if !is_chain_blob(data) {
        let head = &data[..data.len().min(CHAIN_MAGIC.len())];
        return Err(SyncError::codec(format!("bad magic header {:02x?}", head)));
    }

    let body = &data[CHAIN_MAGIC.len()..];
    if let Some(prefix) = body.get(..4) {
        // LZ4 cannot expand a block more than 255x
        let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if declared > body.len().saturating_mul(255) {
            return Err(SyncError::codec(format!(
                "declared size {} is impossible for a {} byte block",
                declared,
                body.len()
            )));
        }
    }

    let start = Instant::now();
    let decoded = decompress_size_prepended(body)
        .map_err(|e| SyncError::codec(format!("LZ4 decompression failed: {}", e)))?;

    trace!(
        "Decoded chain: {} -> {} bytes in {:?}",
        data.len(),
        decoded.len(),
        start.elapsed()
    );
    Ok(decoded)
}

/// Whether `data` starts with the chain magic
pub fn is_chain_blob(data: &[u8]) -> bool {
    data.starts_with(CHAIN_MAGIC)
}
