//! Integrity block: the SHA-256 of every preceding section.
//!
//! Records are `[u32 described id][32-byte digest]`, in table order.

use a3s_image_core::error::{BuildError, Result};

const RECORD_SIZE: usize = 4 + 32;

/// Encode `(id, digest)` pairs.
pub fn encode(entries: &[(u32, [u8; 32])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * RECORD_SIZE);
    for (id, digest) in entries {
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(digest);
    }
    buf
}

/// Decode an integrity block.
pub fn decode(data: &[u8]) -> Result<Vec<(u32, [u8; 32])>> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(BuildError::validation(
            "integrity block",
            format!("length {} is not a multiple of {}", data.len(), RECORD_SIZE),
        ));
    }
    Ok(data
        .chunks_exact(RECORD_SIZE)
        .map(|record| {
            let id = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&record[4..]);
            (id, digest)
        })
        .collect())
}
