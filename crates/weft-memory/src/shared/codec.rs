//! Payload encoding for shared memory: gzip above a threshold plus a
//! SHA-256 checksum of the original bytes.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::error::{MemoryError, MemoryResult};

pub(crate) struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub checksum: String,
}

pub(crate) fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compress payloads of at least `threshold` bytes. The compressed form is
/// kept only when it is actually smaller.
pub(crate) fn encode(payload: Vec<u8>, threshold: u64) -> MemoryResult<Encoded> {
    let checksum = checksum(&payload);
    if (payload.len() as u64) < threshold {
        return Ok(Encoded {
            bytes: payload,
            compressed: false,
            checksum,
        });
    }

    let compressed = gzip(&payload)?;
    if compressed.len() < payload.len() {
        Ok(Encoded {
            bytes: compressed,
            compressed: true,
            checksum,
        })
    } else {
        Ok(Encoded {
            bytes: payload,
            compressed: false,
            checksum,
        })
    }
}

/// Undo [`encode`] and verify the checksum.
pub(crate) fn decode(
    label: &str,
    bytes: Vec<u8>,
    compressed: bool,
    expected: &str,
) -> MemoryResult<Vec<u8>> {
    let payload = if compressed { gunzip(&bytes)? } else { bytes };
    if checksum(&payload) != expected {
        return Err(MemoryError::ChecksumMismatch(label.to_string()));
    }
    Ok(payload)
}

fn gzip(bytes: &[u8]) -> MemoryResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| MemoryError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| MemoryError::Compression(e.to_string()))
}

fn gunzip(bytes: &[u8]) -> MemoryResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| MemoryError::Compression(e.to_string()))?;
    Ok(out)
}
