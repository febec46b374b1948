//! Filesystem storage backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{BlobReader, StorageBackend};
use crate::error::{AppError, Result};

/// Filesystem-based storage backend. Keys are relative paths under the base
/// directory.
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    /// Create new filesystem storage
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Resolve a key to a path, refusing anything that escapes the base
    /// directory.
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(AppError::Validation(format!("Invalid storage key: {:?}", key)));
        }
        Ok(self.base_path.join(relative))
    }
}

fn map_io(key: &str, action: &str, e: std::io::Error) -> AppError {
    if e.kind() == ErrorKind::NotFound {
        AppError::NotFound(format!("Storage key not found: {}", key))
    } else {
        AppError::Storage(format!("Failed to {} {}: {}", action, key, e))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

async fn write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically via a temp file unique to this write
        let temp_path = temp_path_for(&path);
        let written = match write_file(&temp_path, &content).await {
            Ok(()) => fs::rename(&temp_path, &path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!("Failed to remove temp file {}: {}", temp_path.display(), cleanup);
                }
            }
            return Err(map_io(key, "write", e));
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let content = fs::read(&path).await.map_err(|e| map_io(key, "read", e))?;
        Ok(Bytes::from(content))
    }

    async fn open_read(&self, key: &str) -> Result<BlobReader> {
        let path = self.key_to_path(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_io(key, "open", e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_io(key, "delete", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_test_storage() -> (FilesystemStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path());
        (storage, temp_dir)
    }

    async fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut read_dir = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = read_dir.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_sibling_keys_with_same_stem_do_not_collide() {
        let (storage, temp) = create_test_storage();

        let (deb, tar) = tokio::join!(
            storage.put("pool/x.deb", Bytes::from("deb")),
            storage.put("pool/x.tar", Bytes::from("tar")),
        );
        deb.unwrap();
        tar.unwrap();

        assert_eq!(storage.get("pool/x.deb").await.unwrap(), Bytes::from("deb"));
        assert_eq!(storage.get("pool/x.tar").await.unwrap(), Bytes::from("tar"));
        assert_eq!(entries(&temp.path().join("pool")).await, vec!["x.deb", "x.tar"]);
    }

    #[tokio::test]
    async fn test_failed_put_leaves_no_temp_file() {
        let (storage, temp) = create_test_storage();
        // A directory in the way makes the final rename fail.
        fs::create_dir_all(temp.path().join("pool/x.deb")).await.unwrap();

        assert!(storage.put("pool/x.deb", Bytes::from("deb")).await.is_err());
        assert_eq!(entries(&temp.path().join("pool")).await, vec!["x.deb"]);
    }

    #[tokio::test]
    async fn test_put_get() {
        let (storage, _temp) = create_test_storage();

        let content = Bytes::from("deb content");
        storage.put("versions/a/pkg.deb", content.clone()).await.unwrap();

        assert_eq!(storage.get("versions/a/pkg.deb").await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_open_read_streams_content() {
        let (storage, _temp) = create_test_storage();
        storage.put("pkg.deb", Bytes::from("streamed")).await.unwrap();

        let mut reader = storage.open_read("pkg.deb").await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "streamed");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (storage, _temp) = create_test_storage();

        assert!(matches!(
            storage.get("missing.deb").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            storage.open_read("missing.deb").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            storage.delete("missing.deb").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let (storage, _temp) = create_test_storage();

        storage.put("to_delete.deb", Bytes::from("data")).await.unwrap();
        assert!(storage.exists("to_delete.deb").await.unwrap());

        storage.delete("to_delete.deb").await.unwrap();
        assert!(!storage.exists("to_delete.deb").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_keys_outside_base() {
        let (storage, _temp) = create_test_storage();

        for key in ["../escape.deb", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(storage.exists(key).await, Err(AppError::Validation(_))),
                "key {:?} should be rejected",
                key
            );
        }
    }
}
