//! Background task queue.
//!
//! Jobs are typed payloads submitted to a named lane. `LocalTaskQueue` runs
//! one worker per lane inside the process: jobs in a lane execute one at a
//! time in submission order, and each job's outcome stays available for
//! polling through its handle until it is collected by `wait` or pushed out
//! by newer finished jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::event_bus::{DomainEvent, EventBus};

/// Lane used for hash refresh and storage update jobs.
pub const HIGH_LANE: &str = "high";

/// Finished statuses kept for polling before the oldest are dropped.
pub const FINISHED_JOB_RETENTION: usize = 1024;

/// Work understood by the job runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Recompute and persist digests of every listed version.
    RefreshHashes { ids: Vec<Uuid> },
    /// Move a version's file to its canonical key and recompute digests.
    UpdateStorage { id: Uuid },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::RefreshHashes { .. } => "refresh_hashes",
            Job::UpdateStorage { .. } => "update_storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub lane: String,
}

/// Result of one version within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn ok(id: Uuid) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: Uuid, error: &AppError) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Aggregate job result. `success` holds only if every item succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub items: Vec<ItemOutcome>,
    /// Set when the job stopped before producing per-item results.
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn from_items(items: Vec<ItemOutcome>) -> Self {
        Self {
            success: items.iter().all(|i| i.success),
            items,
            error: None,
        }
    }

    /// Outcome of a job that died before reporting per-item results.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            items: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.items.iter().filter(|i| !i.success).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished { outcome: JobOutcome },
}

/// Queue accepted by the lifecycle service.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit `job` to `lane` and return immediately.
    async fn enqueue(&self, lane: &str, job: Job) -> Result<JobHandle>;

    /// Current state of a submitted job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;
}

/// Something that can run a job to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job) -> JobOutcome;
}

#[derive(Default)]
struct TableState {
    statuses: HashMap<Uuid, JobStatus>,
    finished_order: VecDeque<Uuid>,
}

struct JobTable {
    state: Mutex<TableState>,
    finished: Notify,
    retain_finished: usize,
}

impl JobTable {
    fn new(retain_finished: usize) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            finished: Notify::new(),
            retain_finished,
        }
    }

    fn set(&self, id: Uuid, status: JobStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let is_finished = matches!(status, JobStatus::Finished { .. });
        state.statuses.insert(id, status);

        if is_finished {
            state.finished_order.push_back(id);
            while state.finished_order.len() > self.retain_finished {
                if let Some(expired) = state.finished_order.pop_front() {
                    state.statuses.remove(&expired);
                }
            }
        }
    }

    fn get(&self, id: Uuid) -> Option<JobStatus> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.statuses.get(&id).cloned()
    }

    /// Remove and return the outcome if the job has finished.
    fn take_finished(&self, id: Uuid) -> Option<std::result::Result<JobOutcome, JobStatus>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.statuses.get(&id) {
            Some(JobStatus::Finished { .. }) => {}
            Some(pending) => return Some(Err(pending.clone())),
            None => return None,
        }
        state.finished_order.retain(|finished| *finished != id);
        match state.statuses.remove(&id) {
            Some(JobStatus::Finished { outcome }) => Some(Ok(outcome)),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.statuses.len()
    }
}

/// In-process task queue with one tokio worker per lane.
pub struct LocalTaskQueue {
    lanes: HashMap<String, mpsc::UnboundedSender<(Uuid, Job)>>,
    table: Arc<JobTable>,
}

impl LocalTaskQueue {
    /// Start workers for `lanes`. Must be called inside a tokio runtime.
    pub fn start(
        lanes: &[String],
        executor: Arc<dyn JobExecutor>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let table = Arc::new(JobTable::new(FINISHED_JOB_RETENTION));
        let mut senders = HashMap::new();

        for lane in lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_lane(
                lane.clone(),
                rx,
                executor.clone(),
                table.clone(),
                events.clone(),
            ));
            senders.insert(lane.clone(), tx);
        }

        tracing::info!(lanes = ?lanes, "Task queue workers started");

        Self {
            lanes: senders,
            table,
        }
    }

    /// Wait for a job to finish and return its outcome.
    ///
    /// The outcome is collected: `status` reports the job as not found
    /// afterwards.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobOutcome> {
        loop {
            let finished = self.table.finished.notified();
            match self.table.take_finished(handle.id) {
                Some(Ok(outcome)) => return Ok(outcome),
                Some(Err(_)) => finished.await,
                None => return Err(unknown_job(handle)),
            }
        }
    }

    /// Number of jobs whose status is still tracked.
    pub fn tracked_jobs(&self) -> usize {
        self.table.len()
    }
}

async fn run_lane(
    lane: String,
    mut rx: mpsc::UnboundedReceiver<(Uuid, Job)>,
    executor: Arc<dyn JobExecutor>,
    table: Arc<JobTable>,
    events: Option<Arc<EventBus>>,
) {
    while let Some((job_id, job)) = rx.recv().await {
        let job_name = job.name();
        table.set(job_id, JobStatus::Running);
        tracing::debug!(%job_id, lane = %lane, job = job_name, "Job started");

        // Run on its own task so a panicking job fails alone.
        let executor = executor.clone();
        let outcome = match tokio::spawn(async move { executor.execute(job).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%job_id, job = job_name, "Job aborted: {}", e);
                JobOutcome::aborted(e.to_string())
            }
        };

        if outcome.success {
            tracing::info!(%job_id, job = job_name, items = outcome.items.len(), "Job finished");
        } else {
            tracing::warn!(
                %job_id,
                job = job_name,
                failed = outcome.failed_count(),
                items = outcome.items.len(),
                "Job finished with failures"
            );
        }

        let message = if outcome.success {
            format!("{} job finished successfully.", job_name)
        } else {
            format!("{} job finished with {} failure(s).", job_name, outcome.failed_count())
        };

        table.set(job_id, JobStatus::Finished { outcome });
        table.finished.notify_waiters();

        if let Some(bus) = &events {
            bus.publish(DomainEvent::now("job.finished", job_id.to_string(), Some(message)));
        }
    }

    tracing::debug!(lane = %lane, "Task queue lane closed");
}

fn unknown_job(handle: &JobHandle) -> AppError {
    AppError::NotFound(format!("Job {} not found", handle.id))
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, lane: &str, job: Job) -> Result<JobHandle> {
        let sender = self
            .lanes
            .get(lane)
            .ok_or_else(|| AppError::Validation(format!("Unknown task lane '{}'", lane)))?;

        let handle = JobHandle {
            id: Uuid::new_v4(),
            lane: lane.to_string(),
        };
        self.table.set(handle.id, JobStatus::Queued);

        if sender.send((handle.id, job)).is_err() {
            self.table.set(
                handle.id,
                JobStatus::Finished {
                    outcome: JobOutcome::aborted("lane closed"),
                },
            );
            return Err(AppError::Internal(format!("Task lane '{}' is closed", lane)));
        }

        tracing::debug!(job_id = %handle.id, lane, "Job queued");
        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.table.get(handle.id).ok_or_else(|| unknown_job(handle))
    }
}
