//! Common test utilities for lifecycle integration tests
//!
//! This module provides shared infrastructure for testing:
//! - An in-memory service harness over temporary filesystem storage
//! - Storage and queue doubles for failure injection
//! - Version fixtures

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use uuid::Uuid;

use repo_keeper_backend::error::{AppError, Result};
use repo_keeper_backend::models::version::PackageVersion;
use repo_keeper_backend::services::event_bus::EventBus;
use repo_keeper_backend::services::jobs::JobRunner;
use repo_keeper_backend::services::lifecycle_service::LifecycleService;
use repo_keeper_backend::services::task_queue::{
    Job, JobHandle, JobStatus, LocalTaskQueue, TaskQueue,
};
use repo_keeper_backend::services::version_store::{MemoryVersionStore, VersionStore};
use repo_keeper_backend::storage::filesystem::FilesystemStorage;
use repo_keeper_backend::storage::{BlobReader, StorageBackend};

pub const BASE_URL: &str = "https://repo.example.com/storage";

/// Filesystem storage whose deletes can be made to fail.
pub struct FlakyStorage {
    inner: FilesystemStorage,
    fail_deletes: Mutex<bool>,
}

impl FlakyStorage {
    pub fn new(inner: FilesystemStorage) -> Self {
        Self {
            inner,
            fail_deletes: Mutex::new(false),
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        *self.fail_deletes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn put(&self, key: &str, content: Bytes) -> Result<()> {
        self.inner.put(key, content).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(key).await
    }

    async fn open_read(&self, key: &str) -> Result<BlobReader> {
        self.inner.open_read(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if *self.fail_deletes.lock().unwrap() {
            return Err(AppError::Storage(format!("Permission denied: {}", key)));
        }
        self.inner.delete(key).await
    }
}

/// Queue that records submissions without running them.
#[derive(Default)]
pub struct RecordingQueue {
    pub submitted: Mutex<Vec<(String, Job)>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<(String, Job)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, lane: &str, job: Job) -> Result<JobHandle> {
        self.submitted
            .lock()
            .unwrap()
            .push((lane.to_string(), job));
        Ok(JobHandle {
            id: Uuid::new_v4(),
            lane: lane.to_string(),
        })
    }

    async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
        Ok(JobStatus::Queued)
    }
}

/// Lifecycle service wired to real workers.
pub struct Harness {
    pub service: LifecycleService,
    pub queue: Arc<LocalTaskQueue>,
    pub store: Arc<MemoryVersionStore>,
    pub storage: Arc<FlakyStorage>,
    pub events: Arc<EventBus>,
    _temp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MemoryVersionStore::new());
        let storage = Arc::new(FlakyStorage::new(FilesystemStorage::new(temp.path())));
        let events = Arc::new(EventBus::new(64));

        let runner = Arc::new(JobRunner::new(store.clone(), storage.clone()));
        let lanes = vec!["high".to_string(), "default".to_string()];
        let queue = Arc::new(LocalTaskQueue::start(&lanes, runner, Some(events.clone())));

        let mut service = LifecycleService::new(store.clone(), storage.clone(), queue.clone(), BASE_URL);
        service.set_event_bus(events.clone());

        Self {
            service,
            queue,
            store,
            storage,
            events,
            _temp: temp,
        }
    }

    /// Store `content` under an upload key and insert a version pointing at it.
    pub async fn ingest(&self, package: &str, content: Option<&str>) -> PackageVersion {
        let key = format!("uploads/{}.deb", package);
        if let Some(content) = content {
            self.storage
                .put(&key, Bytes::copy_from_slice(content.as_bytes()))
                .await
                .unwrap();
        }
        let mut version = PackageVersion::new(package, "1.0-1", key);
        version.name = package.to_string();
        version.architecture = Some("iphoneos-arm".to_string());
        self.store.insert(&version).await.unwrap();
        version
    }

    pub async fn reload(&self, id: Uuid) -> Option<PackageVersion> {
        self.store.get(id).await.unwrap()
    }
}

/// Lifecycle service whose queue only records submissions.
pub struct RecordingHarness {
    pub service: LifecycleService,
    pub queue: Arc<RecordingQueue>,
    pub store: Arc<MemoryVersionStore>,
    pub storage: Arc<FilesystemStorage>,
    _temp: TempDir,
}

impl RecordingHarness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MemoryVersionStore::new());
        let storage = Arc::new(FilesystemStorage::new(temp.path()));
        let queue = Arc::new(RecordingQueue::default());
        let service = LifecycleService::new(store.clone(), storage.clone(), queue.clone(), BASE_URL);

        Self {
            service,
            queue,
            store,
            storage,
            _temp: temp,
        }
    }

    pub async fn ingest(&self, package: &str, content: &[u8]) -> PackageVersion {
        let key = format!("uploads/{}.deb", package);
        self.storage
            .put(&key, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        let version = PackageVersion::new(package, "1.0-1", key);
        self.store.insert(&version).await.unwrap();
        version
    }
}
