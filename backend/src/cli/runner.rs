//! CLI command runner.
//!
//! Wires the lifecycle service from configuration and executes one parsed
//! command against it.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use crate::cli::commands::{build_edit, Cli, Command};
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::services::event_bus::EventBus;
use crate::services::jobs::JobRunner;
use crate::services::lifecycle_service::{LifecycleService, QueuedJob};
use crate::services::task_queue::{JobOutcome, LocalTaskQueue};
use crate::services::version_store::{PgVersionStore, VersionStore};
use crate::storage::{self, StorageBackend};

/// Services needed to execute commands.
pub struct App {
    pub service: LifecycleService,
    pub queue: Arc<LocalTaskQueue>,
}

/// Text and JSON renderings of a command result.
#[derive(Debug)]
pub struct Report {
    pub message: String,
    pub json: serde_json::Value,
}

impl Report {
    fn new(message: impl Into<String>, json: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            json,
        }
    }
}

/// Connect to the database and storage described by `config`.
pub async fn bootstrap(config: &Config) -> Result<App> {
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");
    db::migrate(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn VersionStore> = Arc::new(PgVersionStore::new(pool));
    let storage = storage::from_config(config).await?;
    Ok(assemble(store, storage, config))
}

/// Build the service graph over an existing store and storage backend.
pub fn assemble(
    store: Arc<dyn VersionStore>,
    storage: Arc<dyn StorageBackend>,
    config: &Config,
) -> App {
    let events = Arc::new(EventBus::new(config.event_bus_capacity));
    let runner = Arc::new(JobRunner::new(store.clone(), storage.clone()));
    let queue = Arc::new(LocalTaskQueue::start(
        &config.task_lanes,
        runner,
        Some(events.clone()),
    ));

    let mut service = LifecycleService::new(store, storage, queue.clone(), &config.public_base_url);
    service.set_event_bus(events.clone());

    App { service, queue }
}

/// Execute `cli.command` and describe the result.
pub async fn run(cli: &Cli, app: &App) -> Result<Report> {
    let service = &app.service;

    match &cli.command {
        Command::Enable { ids } | Command::Disable { ids } => {
            let enabled = matches!(cli.command, Command::Enable { .. });
            let matched = service.set_enabled(ids, enabled).await?;
            let state = if enabled { "enabled" } else { "disabled" };
            Ok(Report::new(
                format!("{} version(s) marked as {}.", matched, state),
                json!({ "matched": matched, "enabled": enabled }),
            ))
        }
        Command::RefreshHashes { ids } => {
            let queued = service.refresh_hashes(ids).await?;
            finish_job(app, cli.no_wait, queued).await
        }
        Command::Edit { id, assignments } => {
            let edit = build_edit(assignments)?;
            let mut version = service.get(*id).await?;
            let changed = edit.apply_to(&mut version)?;
            let outcome = service.save(version, &changed, true).await?;

            let fields: Vec<&str> = outcome.changed_fields.iter().map(|f| f.as_str()).collect();
            let mut message = format!("{} saved.", outcome.version);
            if !fields.is_empty() {
                let _ = write!(message, " Changed: {}.", fields.join(", "));
            }

            match outcome.storage_update {
                Some(queued) => {
                    let job = finish_job(app, cli.no_wait, queued).await?;
                    Ok(Report::new(
                        format!("{}\n{}", message, job.message),
                        json!({
                            "version": outcome.version,
                            "changed_fields": fields,
                            "storage_update": job.json,
                        }),
                    ))
                }
                None => Ok(Report::new(
                    message,
                    json!({ "version": outcome.version, "changed_fields": fields }),
                )),
            }
        }
        Command::ReplaceStorage { id, file } => {
            let content = tokio::fs::read(file).await?;
            let version = service.replace_storage(*id, Bytes::from(content)).await?;
            Ok(Report::new(
                format!(
                    "{} now stored at {}. Hashes must be refreshed.",
                    version, version.storage_key
                ),
                json!({ "version": version }),
            ))
        }
        Command::Delete { ids } => {
            let outcome = service.delete_many(ids).await;
            let deleted = outcome.items.iter().filter(|i| i.deleted).count();
            let mut message = format!("{} of {} version(s) deleted.", deleted, ids.len());
            for item in outcome.items.iter().filter(|i| !i.deleted) {
                let _ = write!(
                    message,
                    "\n  {}: {}",
                    item.id,
                    item.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(Report::new(message, serde_json::to_value(&outcome)?))
        }
        Command::Link { id } => {
            let link = service.storage_link(*id).await?;
            Ok(Report::new(link.clone(), json!({ "id": id, "link": link })))
        }
        Command::Show { id } => {
            let version = service.get(*id).await?;
            let link = service.storage_link_or_placeholder(*id).await?;
            Ok(Report::new(render_version(&version, &link), json!({
                "version": version,
                "link": link,
            })))
        }
    }
}

async fn finish_job(app: &App, no_wait: bool, queued: QueuedJob) -> Result<Report> {
    if no_wait {
        return Ok(Report::new(
            queued.notice.message.clone(),
            json!({ "job": queued.handle, "notice": queued.notice }),
        ));
    }

    let outcome = app.queue.wait(&queued.handle).await?;
    Ok(Report::new(
        format!("{}\n{}", queued.notice.message, summarize(&outcome)),
        json!({ "job": queued.handle, "notice": queued.notice, "outcome": outcome }),
    ))
}

fn summarize(outcome: &JobOutcome) -> String {
    let mut summary = if outcome.success {
        format!("Job finished: {} item(s) succeeded.", outcome.items.len())
    } else {
        format!(
            "Job finished with {} failure(s) out of {} item(s).",
            outcome.failed_count(),
            outcome.items.len()
        )
    };
    if let Some(ref error) = outcome.error {
        let _ = write!(summary, "\n  {}", error);
    }
    for item in outcome.items.iter().filter(|i| !i.success) {
        let _ = write!(
            summary,
            "\n  {}: {}",
            item.id,
            item.error.as_deref().unwrap_or("unknown error")
        );
    }
    summary
}

fn render_version(version: &crate::models::version::PackageVersion, link: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", version);
    let _ = writeln!(out, "  id:       {}", version.id);
    let _ = writeln!(out, "  enabled:  {}", version.enabled);
    let _ = writeln!(out, "  storage:  {}", version.storage_key);
    match &version.digests {
        Some(d) => {
            let _ = writeln!(out, "  size:     {}", d.size);
            let _ = writeln!(out, "  md5:      {}", d.md5);
            let _ = writeln!(out, "  sha1:     {}", d.sha1);
            let _ = writeln!(out, "  sha256:   {}", d.sha256);
            let _ = writeln!(out, "  sha512:   {}", d.sha512);
        }
        None => {
            let _ = writeln!(out, "  digests:  (not computed)");
        }
    }
    let _ = write!(
        out,
        "  link:     {}",
        if link.is_empty() { "(unavailable)" } else { link }
    );
    out
}
