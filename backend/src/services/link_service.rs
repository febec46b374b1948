//! Public link resolution for stored package files.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::version::PackageVersion;
use crate::storage::StorageBackend;

/// Lifetime requested for presigned download links.
const PRESIGNED_LINK_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct LinkService {
    storage: Arc<dyn StorageBackend>,
    public_base_url: String,
}

impl LinkService {
    pub fn new(storage: Arc<dyn StorageBackend>, public_base_url: impl Into<String>) -> Self {
        Self {
            storage,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Produce a dereferenceable link to the version's stored file.
    ///
    /// Fails with `BrokenStorageReference` when the key is empty or does not
    /// resolve to an existing blob. Never writes to storage.
    pub async fn link(&self, version: &PackageVersion) -> Result<String> {
        let key = version.storage_key.as_str();
        if key.is_empty() {
            return Err(AppError::BrokenStorageReference(format!(
                "{} has no storage reference",
                version
            )));
        }

        let exists = self.storage.exists(key).await.map_err(|e| {
            AppError::BrokenStorageReference(format!("{}: {}", key, e))
        })?;
        if !exists {
            return Err(AppError::BrokenStorageReference(format!(
                "{}: blob does not exist",
                key
            )));
        }

        if self.storage.supports_redirect() {
            if let Some(presigned) = self.storage.get_presigned_url(key, PRESIGNED_LINK_TTL).await? {
                return Ok(presigned.url);
            }
        }

        Ok(format!("{}/{}", self.public_base_url, key))
    }

    /// Link for display: a broken reference degrades to an empty string.
    /// Any other failure is returned.
    pub async fn link_or_placeholder(&self, version: &PackageVersion) -> Result<String> {
        match self.link(version).await {
            Ok(link) => Ok(link),
            Err(AppError::BrokenStorageReference(reason)) => {
                tracing::warn!(version_id = %version.id, "Storage link unavailable: {}", reason);
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }
}
