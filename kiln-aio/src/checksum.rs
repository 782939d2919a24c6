// kiln-aio/src/checksum.rs
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let bytes_copied = std::io::copy(&mut reader, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 of {}: {} ({} bytes read)",
        path.display(),
        actual,
        bytes_copied
    );
    Ok(actual)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fails with an integrity error naming `origin` when the digest of `path` differs from
/// `expected`. Comparison ignores hex case.
pub fn verify_checksum(path: &Path, expected: &str, origin: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    compare(origin, expected, actual)
}

/// Reads the file asynchronously but hashes synchronously.
pub async fn verify_checksum_async(path: &Path, expected: &str, origin: &str) -> Result<()> {
    debug!("Async verifying checksum for: {}", path.display());
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    loop {
        buffer.clear();
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    compare(origin, expected, hex::encode(hasher.finalize()))
}

fn compare(origin: &str, expected: &str, actual: String) -> Result<()> {
    debug!("Expected SHA256: {}", expected);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(KilnError::Integrity {
            url: origin.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
