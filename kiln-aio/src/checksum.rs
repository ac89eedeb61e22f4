// kiln-aio/src/checksum.rs
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Hex SHA-256 of a file, read asynchronously in chunks.
pub async fn sha256_file_async(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut total_bytes_read = 0u64;

    loop {
        buffer.clear();
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 for {}: {} ({} bytes read)",
        path.display(),
        actual,
        total_bytes_read
    );
    Ok(actual)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let bytes_copied = std::io::copy(&mut reader, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 for {}: {} ({} bytes read)",
        path.display(),
        actual,
        bytes_copied
    );
    Ok(actual)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn digest_matches(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

/// Fails with `Integrity` carrying both digests when the file does not match.
pub async fn verify_checksum_async(path: &Path, expected: &str) -> Result<()> {
    debug!("Verifying checksum for: {}", path.display());
    let actual = sha256_file_async(path).await?;
    debug!("Expected SHA256:   {}", expected);
    if digest_matches(&actual, expected) {
        Ok(())
    } else {
        Err(KilnError::Integrity {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}
