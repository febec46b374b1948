//! Hash service.
//!
//! Computes the MD5, SHA-1, SHA-256 and SHA-512 digests and byte size of a
//! stored package file in a single streaming pass.

use std::sync::Arc;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncReadExt;

use crate::error::{AppError, Result};
use crate::models::version::{Digests, PackageVersion};
use crate::storage::StorageBackend;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Running state of the four hashers.
#[derive(Default)]
struct MultiHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
    size: u64,
}

impl MultiHasher {
    fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        self.size += chunk.len() as u64;
    }

    fn finish(self) -> Digests {
        Digests {
            md5: format!("{:x}", self.md5.finalize()),
            sha1: format!("{:x}", self.sha1.finalize()),
            sha256: format!("{:x}", self.sha256.finalize()),
            sha512: format!("{:x}", self.sha512.finalize()),
            size: self.size as i64,
        }
    }
}

#[derive(Clone)]
pub struct HashService {
    storage: Arc<dyn StorageBackend>,
}

impl HashService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Calculate all digests of in-memory data
    pub fn digest_bytes(data: &[u8]) -> Digests {
        let mut hasher = MultiHasher::default();
        hasher.update(data);
        hasher.finish()
    }

    /// Stream the blob at `storage_key` and compute its digests.
    ///
    /// Any failure to open or read the blob is reported as
    /// `StorageUnavailable`.
    pub async fn compute(&self, storage_key: &str) -> Result<Digests> {
        let mut reader = self
            .storage
            .open_read(storage_key)
            .await
            .map_err(|e| unavailable(storage_key, &e.to_string()))?;

        let mut hasher = MultiHasher::default();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| unavailable(storage_key, &e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finish())
    }

    /// Recompute digests of `version`'s blob and replace all of them at once.
    /// On failure the previous digests are left untouched.
    pub async fn refresh(&self, version: &mut PackageVersion) -> Result<()> {
        let digests = self.compute(&version.storage_key).await?;
        tracing::debug!(
            version_id = %version.id,
            sha256 = %digests.sha256,
            size = digests.size,
            "Digests recomputed"
        );
        version.digests = Some(digests);
        Ok(())
    }
}

fn unavailable(storage_key: &str, reason: &str) -> AppError {
    AppError::StorageUnavailable(format!("{}: {}", storage_key, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::filesystem::FilesystemStorage;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn create_service() -> (HashService, Arc<dyn StorageBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(FilesystemStorage::new(temp_dir.path()));
        (HashService::new(storage.clone()), storage, temp_dir)
    }

    #[test]
    fn test_digest_known_vectors() {
        let d = HashService::digest_bytes(b"abc");
        assert_eq!(d.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(d.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            d.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            d.sha512,
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
        assert_eq!(d.size, 3);
    }

    #[test]
    fn test_digest_lengths() {
        let d = HashService::digest_bytes(b"");
        assert_eq!(d.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(d.md5.len(), 32);
        assert_eq!(d.sha1.len(), 40);
        assert_eq!(d.sha256.len(), 64);
        assert_eq!(d.sha512.len(), 128);
        assert_eq!(d.size, 0);
    }

    #[tokio::test]
    async fn test_compute_streams_across_chunks() {
        let (service, storage, _temp) = create_service();
        let data: Vec<u8> = (0..(READ_CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        storage.put("big.deb", Bytes::from(data.clone())).await.unwrap();

        let streamed = service.compute("big.deb").await.unwrap();
        assert_eq!(streamed, HashService::digest_bytes(&data));
        assert_eq!(streamed.size, data.len() as i64);
    }

    #[tokio::test]
    async fn test_missing_blob_is_storage_unavailable() {
        let (service, _storage, _temp) = create_service();
        let err = service.compute("missing.deb").await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_digests_on_failure() {
        let (service, storage, _temp) = create_service();
        storage.put("pkg.deb", Bytes::from("v1")).await.unwrap();

        let mut version = PackageVersion::new("pkg", "1.0", "pkg.deb");
        service.refresh(&mut version).await.unwrap();
        let before = version.digests.clone();
        assert_eq!(before, Some(HashService::digest_bytes(b"v1")));

        storage.delete("pkg.deb").await.unwrap();
        assert!(service.refresh(&mut version).await.is_err());
        assert_eq!(version.digests, before);
    }
}
