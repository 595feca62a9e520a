// SHA-256 digests on both ends of a transfer

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::types::{StageError, StageResult};

pub async fn local_sha256(path: &Path) -> StageResult<String> {
    let content = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// First field of `sha256sum` output, if it looks like a digest
pub fn parse_sha256sum(stdout: &str) -> Option<String> {
    let digest = stdout.split_whitespace().next()?;
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Accept the transfer only when both sides agree
pub fn verify(expected: String, actual: String) -> StageResult<String> {
    if expected == actual {
        Ok(expected)
    } else {
        Err(StageError::Verification { expected, actual })
    }
}
