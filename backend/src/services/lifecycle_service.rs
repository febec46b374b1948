//! Package version lifecycle service.
//!
//! Single entry point for state transitions on package versions:
//! - bulk enable/disable
//! - batch hash refresh on the "high" task lane
//! - save with synchronous hash refresh and storage-update triggering
//! - storage replacement
//! - deletion of the record together with its stored file
//!
//! Versions are created by package ingestion only; creation through this
//! service is always denied.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::version::{PackageVersion, VersionField};
use crate::services::event_bus::{DomainEvent, EventBus};
use crate::services::hash_service::HashService;
use crate::services::link_service::LinkService;
use crate::services::task_queue::{Job, JobHandle, TaskQueue, HIGH_LANE};
use crate::services::version_store::VersionStore;
use crate::storage::{BlobLocks, StorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// Human-readable message for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }
}

/// Acknowledgement of a job submitted on the caller's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub notice: Notice,
}

/// Result of `LifecycleService::save`.
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub version: PackageVersion,
    pub changed_fields: BTreeSet<VersionField>,
    /// Present when the edit requires the stored file to be rebuilt.
    pub storage_update: Option<QueuedJob>,
}

/// Per-version result of a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteItem {
    pub id: Uuid,
    pub deleted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchDeleteOutcome {
    pub success: bool,
    pub items: Vec<DeleteItem>,
}

/// Bulk actions offered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Enable(Vec<Uuid>),
    Disable(Vec<Uuid>),
    RefreshHashes(Vec<Uuid>),
    Delete(Vec<Uuid>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    Updated { matched: u64, notice: Notice },
    Queued(QueuedJob),
    Deleted(BatchDeleteOutcome),
}

/// Field values accepted by `LifecycleService::create`; always refused.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub package: String,
    pub version: String,
}

pub struct LifecycleService {
    store: Arc<dyn VersionStore>,
    storage: Arc<dyn StorageBackend>,
    queue: Arc<dyn TaskQueue>,
    hashes: HashService,
    links: LinkService,
    locks: BlobLocks,
    events: Option<Arc<EventBus>>,
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn VersionStore>,
        storage: Arc<dyn StorageBackend>,
        queue: Arc<dyn TaskQueue>,
        public_base_url: &str,
    ) -> Self {
        Self {
            hashes: HashService::new(storage.clone()),
            links: LinkService::new(storage.clone(), public_base_url),
            store,
            storage,
            queue,
            locks: BlobLocks::new(),
            events: None,
        }
    }

    /// Set the event bus used for out-of-band notices.
    pub fn set_event_bus(&mut self, events: Arc<EventBus>) {
        self.events = Some(events);
    }

    fn publish(&self, event_type: &str, entity_id: impl Into<String>, message: Option<String>) {
        if let Some(ref bus) = self.events {
            bus.publish(DomainEvent::now(event_type, entity_id, message));
        }
    }

    async fn load(&self, id: Uuid) -> Result<PackageVersion> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Version {} not found", id)))
    }

    pub async fn get(&self, id: Uuid) -> Result<PackageVersion> {
        self.load(id).await
    }

    /// Creation is reserved for package ingestion.
    pub async fn create(&self, request: NewVersion) -> Result<PackageVersion> {
        Err(Self::deny_creation(&request.package, &request.version))
    }

    fn deny_creation(package: &str, version: &str) -> AppError {
        tracing::warn!(
            package = %package,
            version = %version,
            "Rejected attempt to create a version through the lifecycle service"
        );
        AppError::PermissionDenied(
            "Package versions can only be added by package ingestion".to_string(),
        )
    }

    /// Set `enabled` on every listed version. Idempotent.
    pub async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64> {
        let matched = self.store.set_enabled(ids, enabled).await?;
        tracing::info!(requested = ids.len(), matched, enabled, "Updated enabled flag");
        Ok(matched)
    }

    /// Submit one hash refresh job for all listed versions and return at once.
    pub async fn refresh_hashes(&self, ids: &[Uuid]) -> Result<QueuedJob> {
        let handle = self
            .queue
            .enqueue(HIGH_LANE, Job::RefreshHashes { ids: ids.to_vec() })
            .await?;

        let notice = Notice::info(format!(
            "Hash updating job has been added to the \"{}\" queue.",
            HIGH_LANE
        ));
        tracing::info!(job_id = %handle.id, versions = ids.len(), "Hash refresh queued");
        self.publish("job.queued", handle.id.to_string(), Some(notice.message.clone()));

        Ok(QueuedJob { handle, notice })
    }

    /// Persist an edited version.
    ///
    /// Digests are recomputed from the stored file before anything is written;
    /// if that fails the error is returned and nothing is persisted. When an
    /// existing version changes in a field outside the exempt set, one storage
    /// update job is queued. `is_update == false` is a creation and is denied.
    pub async fn save(
        &self,
        mut version: PackageVersion,
        changed_fields: &BTreeSet<VersionField>,
        is_update: bool,
    ) -> Result<SaveOutcome> {
        if !is_update {
            return Err(Self::deny_creation(&version.package, &version.version));
        }

        let stored = self.load(version.id).await?;
        if version.storage_key != stored.storage_key {
            return Err(AppError::Validation(
                "Storage can only be changed by a storage update".to_string(),
            ));
        }

        self.hashes.refresh(&mut version).await?;
        self.store.update(&version).await?;
        tracing::info!(version_id = %version.id, changed = changed_fields.len(), "Version saved");

        let needs_storage_update = changed_fields.iter().any(|f| !f.is_exempt());
        let storage_update = if needs_storage_update {
            let handle = self
                .queue
                .enqueue(HIGH_LANE, Job::UpdateStorage { id: version.id })
                .await?;
            let notice = Notice::info(format!(
                "{} storage updating job has been added to the \"{}\" queue.",
                version, HIGH_LANE
            ));
            self.publish("job.queued", handle.id.to_string(), Some(notice.message.clone()));
            Some(QueuedJob { handle, notice })
        } else {
            None
        };

        Ok(SaveOutcome {
            version,
            changed_fields: changed_fields.clone(),
            storage_update,
        })
    }

    /// Replace a version's stored file with `content`.
    ///
    /// The new file gets a fresh key and the digests become stale until the
    /// next refresh. The previous file is removed once the record points away
    /// from it.
    pub async fn replace_storage(&self, id: Uuid, content: Bytes) -> Result<PackageVersion> {
        let mut version = self.load(id).await?;
        let new_key = format!("versions/{}/{}.deb", id, Uuid::new_v4());

        self.storage.put(&new_key, content).await?;
        let previous = std::mem::replace(&mut version.storage_key, new_key);
        version.digests = None;

        if let Err(e) = self.store.update(&version).await {
            if let Err(cleanup) = self.storage.delete(&version.storage_key).await {
                tracing::warn!("Failed to remove unused upload {}: {}", version.storage_key, cleanup);
            }
            return Err(e);
        }

        {
            let _lease = self.locks.acquire(&previous).await;
            if let Err(e) = self.storage.delete(&previous).await {
                tracing::warn!(version_id = %id, "Failed to remove replaced file {}: {}", previous, e);
            }
        }

        tracing::info!(version_id = %id, storage_key = %version.storage_key, "Storage replaced");
        self.publish(
            "version.storage_replaced",
            id.to_string(),
            Some(format!("{} storage has been replaced; hashes are stale.", version)),
        );
        Ok(version)
    }

    /// Remove the stored file, then the record.
    ///
    /// If the file cannot be removed the record is kept and the error is
    /// returned. The blob lease is held only for the unlink.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let version = self.load(id).await?;

        {
            let _lease = self.locks.acquire(&version.storage_key).await;
            self.storage.delete(&version.storage_key).await?;
        }

        if !self.store.remove(id).await? {
            tracing::warn!(version_id = %id, "Version disappeared before removal");
        }

        tracing::info!(version_id = %id, storage_key = %version.storage_key, "Version deleted");
        self.publish("version.deleted", id.to_string(), Some(format!("{} deleted.", version)));
        Ok(())
    }

    /// Delete each listed version, continuing past failures.
    pub async fn delete_many(&self, ids: &[Uuid]) -> BatchDeleteOutcome {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.delete(id).await {
                Ok(()) => items.push(DeleteItem {
                    id,
                    deleted: true,
                    error: None,
                }),
                Err(e) => {
                    tracing::warn!(version_id = %id, "Delete failed: {}", e);
                    items.push(DeleteItem {
                        id,
                        deleted: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        BatchDeleteOutcome {
            success: items.iter().all(|i| i.deleted),
            items,
        }
    }

    /// Public link to the version's stored file.
    pub async fn storage_link(&self, id: Uuid) -> Result<String> {
        let version = self.load(id).await?;
        self.links.link(&version).await
    }

    /// Link for display. A broken storage reference yields an empty link;
    /// lookup and backend failures are returned.
    pub async fn storage_link_or_placeholder(&self, id: Uuid) -> Result<String> {
        let version = self.load(id).await?;
        self.links.link_or_placeholder(&version).await
    }

    /// Run a bulk action.
    pub async fn dispatch(&self, action: Action) -> Result<ActionOutcome> {
        match action {
            Action::Enable(ids) => {
                let matched = self.set_enabled(&ids, true).await?;
                Ok(ActionOutcome::Updated {
                    matched,
                    notice: enabled_notice(&ids, matched, "enabled"),
                })
            }
            Action::Disable(ids) => {
                let matched = self.set_enabled(&ids, false).await?;
                Ok(ActionOutcome::Updated {
                    matched,
                    notice: enabled_notice(&ids, matched, "disabled"),
                })
            }
            Action::RefreshHashes(ids) => Ok(ActionOutcome::Queued(self.refresh_hashes(&ids).await?)),
            Action::Delete(ids) => Ok(ActionOutcome::Deleted(self.delete_many(&ids).await)),
        }
    }
}

fn enabled_notice(requested: &[Uuid], matched: u64, state: &str) -> Notice {
    let unique = requested.iter().collect::<BTreeSet<_>>().len() as u64;
    if matched < unique {
        Notice::warning(format!(
            "{} version(s) marked as {}; {} not found.",
            matched,
            state,
            unique - matched
        ))
    } else {
        Notice::info(format!("{} version(s) marked as {}.", matched, state))
    }
}
