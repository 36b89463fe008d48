//! Streamed content hashing for the claim fingerprint.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 1024 * 1024;

pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.with_context(|| format!("open {path:?} for hashing"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.with_context(|| format!("read {path:?} while hashing"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_is_stable_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.bin");
        let p2 = dir.path().join("b.bin");
        std::fs::write(&p1, b"hello world").unwrap();
        std::fs::write(&p2, b"hello world").unwrap();

        let h1 = sha256_file(&p1).await.unwrap();
        let h2 = sha256_file(&p2).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn hash_differs_for_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.bin");
        let p2 = dir.path().join("b.bin");
        std::fs::write(&p1, b"hello world").unwrap();
        std::fs::write(&p2, b"goodbye world").unwrap();

        let h1 = sha256_file(&p1).await.unwrap();
        let h2 = sha256_file(&p2).await.unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn hash_streams_content_larger_than_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.bin");
        std::fs::write(&p, vec![7u8; CHUNK_SIZE * 2 + 17]).unwrap();
        let h = sha256_file(&p).await.unwrap();
        assert_eq!(h.len(), 64);
    }
}
