//! Content Addresser
//!
//! SHA-256 digests for chunk and whole-file verification. Whole files are
//! hashed through a fixed-size buffer so memory use does not depend on the
//! file size.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::types::UploadError;

/// Read buffer used when hashing files: 64 KiB
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Incremental SHA-256 accumulator
#[derive(Clone, Default)]
pub struct ContentHasher {
    hasher: Sha256,
    bytes_hashed: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next run of bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Total bytes fed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Consume the accumulator and return the lowercase hex digest
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify hash matches data (hex comparison is case-insensitive)
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash.trim())
}

/// Hash a file without loading it into memory
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Normalize a client-supplied digest to lowercase hex.
///
/// Digests double as artifact file names, so anything other than exactly
/// 64 hex characters is rejected.
pub fn normalize_digest(digest: &str) -> Result<String, UploadError> {
    let digest = digest.trim();
    if digest.len() != DIGEST_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UploadError::InvalidRequest(format!(
            "expected a hex SHA-256 digest, got {:?}",
            digest
        )));
    }
    Ok(digest.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_compute_hash_known_vector() {
        assert_eq!(compute_hash(b"abc"), ABC_SHA256);
        assert_eq!(compute_hash(b"abc").len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"AAA");
        hasher.update(b"BBB");
        hasher.update(b"CCC");
        assert_eq!(hasher.bytes_hashed(), 9);
        assert_eq!(hasher.finalize(), compute_hash(b"AAABBBCCC"));
    }

    #[test]
    fn test_verify_hash_case_insensitive() {
        assert!(verify_hash(b"abc", &ABC_SHA256.to_uppercase()));
        assert!(!verify_hash(b"abd", ABC_SHA256));
    }

    #[test]
    fn test_normalize_digest() {
        assert_eq!(
            normalize_digest(&format!("  {}  ", ABC_SHA256.to_uppercase())).unwrap(),
            ABC_SHA256
        );
        assert!(normalize_digest("abc").is_err());
        assert!(normalize_digest(&"g".repeat(DIGEST_HEX_LEN)).is_err());
        assert!(normalize_digest(&format!("../{}", &ABC_SHA256[3..])).is_err());
    }

    #[tokio::test]
    async fn test_hash_file_spans_multiple_buffers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("large.bin");
        let data: Vec<u8> = (0..HASH_BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), compute_hash(&data));
    }

    #[tokio::test]
    async fn test_hash_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), compute_hash(b""));
    }
}
