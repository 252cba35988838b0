//! Streaming content integrity verification.
//!
//! Hashes run over a fixed buffer so memory stays constant regardless of
//! artifact size. Verification fails closed: a read error is treated the
//! same as a mismatch and the file is never partially trusted.

use std::io::Read;
use std::path::Path;

use ota_schema::Sha256Digest;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced by integrity verification.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// The file could not be read to completion.
    #[error("IO error while hashing: {0}")]
    Io(#[from] std::io::Error),

    /// The computed digest did not match the expected one.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    Mismatch {
        /// Digest the manifest promised.
        expected: Sha256Digest,
        /// Digest actually computed from the file.
        actual: Sha256Digest,
    },
}

/// Compute the SHA-256 digest of a file with constant memory.
pub fn hash_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(Sha256Digest::from_bytes(&hasher.finalize()))
}

/// Verify that `path` hashes to `expected`.
///
/// # Errors
///
/// Returns [`VerifyError::Io`] if the file cannot be read to completion and
/// [`VerifyError::Mismatch`] on a digest mismatch. Either way the file must
/// not be trusted.
pub fn verify(path: &Path, expected: &Sha256Digest) -> Result<(), VerifyError> {
    let actual = hash_file(path)?;
    if actual == *expected {
        Ok(())
    } else {
        Err(VerifyError::Mismatch {
            expected: expected.clone(),
            actual,
        })
    }
}
