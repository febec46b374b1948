//! Storage backends.

pub mod filesystem;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::Config;
use crate::error::{AppError, Result};

/// Streaming reader over a stored blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Result of a presigned URL request
#[derive(Debug, Clone)]
pub struct PresignedUrl {
    /// The presigned URL for direct access
    pub url: String,
    /// When the URL expires
    pub expires_in: Duration,
}

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store content with the given key, replacing any existing blob
    async fn put(&self, key: &str, content: Bytes) -> Result<()>;

    /// Retrieve content by key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Open a streaming reader over the content at key
    async fn open_read(&self, key: &str) -> Result<BlobReader>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete content by key. Fails with `NotFound` when the key is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if this backend supports redirect downloads via presigned URLs
    fn supports_redirect(&self) -> bool {
        false
    }

    /// Get a presigned URL for direct download (if supported)
    ///
    /// Returns `Ok(Some(url))` if presigned URLs are supported and enabled,
    /// `Ok(None)` if not supported or disabled, or an error if generation fails.
    async fn get_presigned_url(&self, key: &str, expires_in: Duration) -> Result<Option<PresignedUrl>> {
        let _ = (key, expires_in);
        Ok(None)
    }
}

/// Build the configured storage backend.
pub async fn from_config(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.storage_backend.as_str() {
        "filesystem" => {
            let path = PathBuf::from(&config.storage_path);
            tokio::fs::create_dir_all(&path).await?;
            Ok(Arc::new(filesystem::FilesystemStorage::new(path)))
        }
        other => Err(AppError::Config(format!(
            "Unknown storage backend: {}",
            other
        ))),
    }
}

/// Per-key exclusive leases over stored blobs.
///
/// A lease is held only while a blob is being unlinked. Entries are removed
/// from the table once the last holder or waiter of a key is gone.
#[derive(Clone, Default)]
pub struct BlobLocks {
    inflight: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl BlobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn acquire(&self, key: &str) -> BlobLease {
        let lock = {
            let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                map.entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = lock.lock_owned().await;
        BlobLease {
            key: key.to_string(),
            inflight: self.inflight.clone(),
            guard: Some(guard),
        }
    }
}

/// Exclusive hold on one storage key, released on drop.
pub struct BlobLease {
    key: String,
    inflight: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        // The table and this lease's guard are the only references when nobody waits.
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            map.remove(&self.key);
        }
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(locks: &BlobLocks) -> usize {
        locks.inflight.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_lease_released_on_drop() {
        let locks = BlobLocks::new();
        {
            let _lease = locks.acquire("versions/a.deb").await;
            assert_eq!(tracked(&locks), 1);
        }
        assert_eq!(tracked(&locks), 0);

        let again =
            tokio::time::timeout(Duration::from_millis(100), locks.acquire("versions/a.deb")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let locks = BlobLocks::new();
        let first = locks.acquire("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _lease = locks.acquire("k").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        // The waiter still references the key, so it stays tracked until it is done.
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert_eq!(tracked(&locks), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = BlobLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(tracked(&locks), 2);
    }
}
