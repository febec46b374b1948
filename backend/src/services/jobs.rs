//! Job runner for background lifecycle work.
//!
//! Executes the jobs submitted by `LifecycleService`. Per-version failures
//! are recorded in the job outcome and never abort the remaining versions.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::version::PackageVersion;
use crate::services::hash_service::HashService;
use crate::services::task_queue::{ItemOutcome, Job, JobExecutor, JobOutcome};
use crate::services::version_store::VersionStore;
use crate::storage::StorageBackend;

pub struct JobRunner {
    store: Arc<dyn VersionStore>,
    storage: Arc<dyn StorageBackend>,
    hashes: HashService,
}

impl JobRunner {
    pub fn new(store: Arc<dyn VersionStore>, storage: Arc<dyn StorageBackend>) -> Self {
        let hashes = HashService::new(storage.clone());
        Self {
            store,
            storage,
            hashes,
        }
    }

    /// Recompute and persist digests for each version in turn.
    pub async fn refresh_hashes(&self, ids: &[Uuid]) -> JobOutcome {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.refresh_one(id).await {
                Ok(()) => items.push(ItemOutcome::ok(id)),
                Err(e) => {
                    tracing::warn!(version_id = %id, "Hash refresh failed: {}", e);
                    items.push(ItemOutcome::failed(id, &e));
                }
            }
        }
        JobOutcome::from_items(items)
    }

    async fn refresh_one(&self, id: Uuid) -> Result<()> {
        let mut version = self.load(id).await?;
        self.hashes.refresh(&mut version).await?;
        self.store.update(&version).await
    }

    /// Relocate a version's file to its canonical key and recompute digests.
    pub async fn update_storage(&self, id: Uuid) -> JobOutcome {
        let item = match self.relocate(id).await {
            Ok(()) => ItemOutcome::ok(id),
            Err(e) => {
                tracing::warn!(version_id = %id, "Storage update failed: {}", e);
                ItemOutcome::failed(id, &e)
            }
        };
        JobOutcome::from_items(vec![item])
    }

    async fn relocate(&self, id: Uuid) -> Result<()> {
        let mut version = self.load(id).await?;
        let target = version.canonical_storage_key();

        if target == version.storage_key {
            self.hashes.refresh(&mut version).await?;
            return self.store.update(&version).await;
        }

        let content = self
            .storage
            .get(&version.storage_key)
            .await
            .map_err(|e| AppError::StorageUnavailable(format!("{}: {}", version.storage_key, e)))?;
        self.storage.put(&target, content).await?;

        let previous = std::mem::replace(&mut version.storage_key, target);
        version.digests = None;
        if let Err(e) = self.hashes.refresh(&mut version).await {
            // Record still points at the old file; leave it consistent.
            self.discard(&version.storage_key).await;
            return Err(e);
        }

        if let Err(e) = self.store.update(&version).await {
            self.discard(&version.storage_key).await;
            return Err(e);
        }

        tracing::info!(
            version_id = %id,
            from = %previous,
            to = %version.storage_key,
            "Storage relocated"
        );
        self.discard(&previous).await;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<PackageVersion> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Version {} not found", id)))
    }

    /// Best-effort removal of a blob no record points at.
    async fn discard(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            tracing::warn!(storage_key = key, "Failed to remove unreferenced blob: {}", e);
        }
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(&self, job: Job) -> JobOutcome {
        match job {
            Job::RefreshHashes { ids } => self.refresh_hashes(&ids).await,
            Job::UpdateStorage { id } => self.update_storage(id).await,
        }
    }
}
