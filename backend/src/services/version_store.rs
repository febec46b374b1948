//! Package version persistence.
//!
//! `VersionStore` is the seam between the lifecycle core and the database.
//! Writes are last-write-wins: two jobs updating the same version race and the
//! later `update` overwrites the earlier one.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::version::{Digests, PackageVersion};

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Insert a version created by package ingestion. Fails with
    /// `PersistenceConflict` when the (package, version) pair exists.
    async fn insert(&self, version: &PackageVersion) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<PackageVersion>>;

    /// Overwrite all editable and computed columns. `download_times` and
    /// `created_at` are owned by other writers and are left as stored.
    async fn update(&self, version: &PackageVersion) -> Result<()>;

    /// Set `enabled` on every listed version. Returns the number matched.
    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64>;

    /// Remove the row. Returns whether a row was removed.
    async fn remove(&self, id: Uuid) -> Result<bool>;

    /// Versions eligible for the public package index.
    async fn list_enabled(&self) -> Result<Vec<PackageVersion>>;
}

/// In-memory store, used by tests and tooling that runs without a database.
#[derive(Default)]
pub struct MemoryVersionStore {
    versions: RwLock<HashMap<Uuid, PackageVersion>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.versions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.versions.read().await.is_empty()
    }
}

fn pair_conflict(version: &PackageVersion) -> AppError {
    AppError::PersistenceConflict(format!("{} already exists", version))
}

fn same_pair(a: &PackageVersion, b: &PackageVersion) -> bool {
    a.package == b.package && a.version == b.version
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn insert(&self, version: &PackageVersion) -> Result<()> {
        let mut versions = self.versions.write().await;
        if versions.contains_key(&version.id) || versions.values().any(|v| same_pair(v, version)) {
            return Err(pair_conflict(version));
        }
        versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PackageVersion>> {
        Ok(self.versions.read().await.get(&id).cloned())
    }

    async fn update(&self, version: &PackageVersion) -> Result<()> {
        let mut versions = self.versions.write().await;
        if versions
            .values()
            .any(|v| v.id != version.id && same_pair(v, version))
        {
            return Err(pair_conflict(version));
        }

        let stored = versions
            .get_mut(&version.id)
            .ok_or_else(|| AppError::NotFound(format!("Version {} not found", version.id)))?;
        let download_times = stored.download_times;
        let created_at = stored.created_at;
        *stored = version.clone();
        stored.download_times = download_times;
        stored.created_at = created_at;
        Ok(())
    }

    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64> {
        let mut versions = self.versions.write().await;
        let unique: BTreeSet<&Uuid> = ids.iter().collect();
        let mut matched = 0;
        for id in unique {
            if let Some(v) = versions.get_mut(id) {
                v.enabled = enabled;
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        Ok(self.versions.write().await.remove(&id).is_some())
    }

    async fn list_enabled(&self) -> Result<Vec<PackageVersion>> {
        let mut enabled: Vec<PackageVersion> = self
            .versions
            .read()
            .await
            .values()
            .filter(|v| v.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| {
            (&a.package, a.created_at).cmp(&(&b.package, b.created_at))
        });
        Ok(enabled)
    }
}

/// Columns written by both insert and update, in bind order.
const MUTABLE_COLUMNS: [&str; 48] = [
    "enabled",
    "package",
    "version",
    "name",
    "section",
    "icon",
    "description",
    "update_logs",
    "custom_depiction",
    "depiction",
    "homepage",
    "maintainer_name",
    "maintainer_email",
    "author_name",
    "author_email",
    "sponsor_name",
    "sponsor_site",
    "architecture",
    "priority",
    "essential",
    "tag",
    "depends",
    "pre_depends",
    "conflicts",
    "replaces",
    "provides",
    "recommends",
    "suggests",
    "breaks",
    "origin",
    "source",
    "bugs",
    "installer_menu_item",
    "build_essential",
    "built_using",
    "built_for_profiles",
    "multi_arch",
    "subarchitecture",
    "kernel_version",
    "os_compatibility",
    "device_compatibility",
    "md5",
    "sha1",
    "sha256",
    "sha512",
    "size",
    "installed_size",
    "storage_key",
];

/// Columns only written on insert, bound after `MUTABLE_COLUMNS`.
const INSERT_ONLY_COLUMNS: [&str; 2] = ["download_times", "created_at"];

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT id, {}, {} FROM package_versions {}",
        MUTABLE_COLUMNS.join(", "),
        INSERT_ONLY_COLUMNS.join(", "),
        filter
    )
}

fn insert_sql() -> String {
    let columns: Vec<&str> = MUTABLE_COLUMNS
        .iter()
        .chain(INSERT_ONLY_COLUMNS.iter())
        .copied()
        .collect();
    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO package_versions (id, {}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn update_sql() -> String {
    let assignments: Vec<String> = MUTABLE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", column, i + 2))
        .collect();
    format!(
        "UPDATE package_versions SET {} WHERE id = $1",
        assignments.join(", ")
    )
}

/// Row shape of the `package_versions` table.
#[derive(Debug, sqlx::FromRow)]
struct PackageVersionRow {
    id: Uuid,
    enabled: bool,
    package: String,
    version: String,
    name: String,
    section: Option<String>,
    icon: Option<String>,
    description: Option<String>,
    update_logs: Option<String>,
    custom_depiction: Option<String>,
    depiction: Option<String>,
    homepage: Option<String>,
    maintainer_name: Option<String>,
    maintainer_email: Option<String>,
    author_name: Option<String>,
    author_email: Option<String>,
    sponsor_name: Option<String>,
    sponsor_site: Option<String>,
    architecture: Option<String>,
    priority: Option<String>,
    essential: Option<String>,
    tag: Option<String>,
    depends: Option<String>,
    pre_depends: Option<String>,
    conflicts: Option<String>,
    replaces: Option<String>,
    provides: Option<String>,
    recommends: Option<String>,
    suggests: Option<String>,
    breaks: Option<String>,
    origin: Option<String>,
    source: Option<String>,
    bugs: Option<String>,
    installer_menu_item: Option<String>,
    build_essential: Option<String>,
    built_using: Option<String>,
    built_for_profiles: Option<String>,
    multi_arch: Option<String>,
    subarchitecture: Option<String>,
    kernel_version: Option<String>,
    os_compatibility: Vec<i32>,
    device_compatibility: Vec<i32>,
    md5: Option<String>,
    sha1: Option<String>,
    sha256: Option<String>,
    sha512: Option<String>,
    size: Option<i64>,
    installed_size: Option<i64>,
    storage_key: String,
    download_times: i64,
    created_at: DateTime<Utc>,
}

impl From<PackageVersionRow> for PackageVersion {
    fn from(row: PackageVersionRow) -> Self {
        // Digests are only meaningful as a complete set.
        let digests = match (row.md5, row.sha1, row.sha256, row.sha512, row.size) {
            (Some(md5), Some(sha1), Some(sha256), Some(sha512), Some(size)) => Some(Digests {
                md5,
                sha1,
                sha256,
                sha512,
                size,
            }),
            _ => None,
        };

        Self {
            id: row.id,
            enabled: row.enabled,
            package: row.package,
            version: row.version,
            name: row.name,
            section: row.section,
            icon: row.icon,
            description: row.description,
            update_logs: row.update_logs,
            custom_depiction: row.custom_depiction,
            depiction: row.depiction,
            homepage: row.homepage,
            maintainer_name: row.maintainer_name,
            maintainer_email: row.maintainer_email,
            author_name: row.author_name,
            author_email: row.author_email,
            sponsor_name: row.sponsor_name,
            sponsor_site: row.sponsor_site,
            architecture: row.architecture,
            priority: row.priority,
            essential: row.essential,
            tag: row.tag,
            depends: row.depends,
            pre_depends: row.pre_depends,
            conflicts: row.conflicts,
            replaces: row.replaces,
            provides: row.provides,
            recommends: row.recommends,
            suggests: row.suggests,
            breaks: row.breaks,
            origin: row.origin,
            source: row.source,
            bugs: row.bugs,
            installer_menu_item: row.installer_menu_item,
            build_essential: row.build_essential,
            built_using: row.built_using,
            built_for_profiles: row.built_for_profiles,
            multi_arch: row.multi_arch,
            subarchitecture: row.subarchitecture,
            kernel_version: row.kernel_version,
            os_compatibility: row.os_compatibility.into_iter().collect(),
            device_compatibility: row.device_compatibility.into_iter().collect(),
            digests,
            installed_size: row.installed_size,
            storage_key: row.storage_key,
            download_times: row.download_times,
            created_at: row.created_at,
        }
    }
}

/// Bind `MUTABLE_COLUMNS` in order.
fn bind_mutable<'q>(
    query: Query<'q, Postgres, PgArguments>,
    v: &'q PackageVersion,
) -> Query<'q, Postgres, PgArguments> {
    let digests = v.digests.as_ref();
    query
        .bind(v.enabled)
        .bind(v.package.as_str())
        .bind(v.version.as_str())
        .bind(v.name.as_str())
        .bind(v.section.as_deref())
        .bind(v.icon.as_deref())
        .bind(v.description.as_deref())
        .bind(v.update_logs.as_deref())
        .bind(v.custom_depiction.as_deref())
        .bind(v.depiction.as_deref())
        .bind(v.homepage.as_deref())
        .bind(v.maintainer_name.as_deref())
        .bind(v.maintainer_email.as_deref())
        .bind(v.author_name.as_deref())
        .bind(v.author_email.as_deref())
        .bind(v.sponsor_name.as_deref())
        .bind(v.sponsor_site.as_deref())
        .bind(v.architecture.as_deref())
        .bind(v.priority.as_deref())
        .bind(v.essential.as_deref())
        .bind(v.tag.as_deref())
        .bind(v.depends.as_deref())
        .bind(v.pre_depends.as_deref())
        .bind(v.conflicts.as_deref())
        .bind(v.replaces.as_deref())
        .bind(v.provides.as_deref())
        .bind(v.recommends.as_deref())
        .bind(v.suggests.as_deref())
        .bind(v.breaks.as_deref())
        .bind(v.origin.as_deref())
        .bind(v.source.as_deref())
        .bind(v.bugs.as_deref())
        .bind(v.installer_menu_item.as_deref())
        .bind(v.build_essential.as_deref())
        .bind(v.built_using.as_deref())
        .bind(v.built_for_profiles.as_deref())
        .bind(v.multi_arch.as_deref())
        .bind(v.subarchitecture.as_deref())
        .bind(v.kernel_version.as_deref())
        .bind(v.os_compatibility.iter().copied().collect::<Vec<i32>>())
        .bind(v.device_compatibility.iter().copied().collect::<Vec<i32>>())
        .bind(digests.map(|d| d.md5.as_str()))
        .bind(digests.map(|d| d.sha1.as_str()))
        .bind(digests.map(|d| d.sha256.as_str()))
        .bind(digests.map(|d| d.sha512.as_str()))
        .bind(digests.map(|d| d.size))
        .bind(v.installed_size)
        .bind(v.storage_key.as_str())
}

/// PostgreSQL-backed store over the `package_versions` table.
pub struct PgVersionStore {
    db: PgPool,
}

impl PgVersionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn insert(&self, version: &PackageVersion) -> Result<()> {
        let sql = insert_sql();
        bind_mutable(sqlx::query(&sql).bind(version.id), version)
            .bind(version.download_times)
            .bind(version.created_at)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PackageVersion>> {
        let row = sqlx::query_as::<_, PackageVersionRow>(&select_sql("WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(PackageVersion::from))
    }

    async fn update(&self, version: &PackageVersion) -> Result<()> {
        let sql = update_sql();
        let result = bind_mutable(sqlx::query(&sql).bind(version.id), version)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Version {} not found",
                version.id
            )));
        }
        Ok(())
    }

    async fn set_enabled(&self, ids: &[Uuid], enabled: bool) -> Result<u64> {
        let result = sqlx::query("UPDATE package_versions SET enabled = $2 WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .bind(enabled)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM package_versions WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_enabled(&self) -> Result<Vec<PackageVersion>> {
        let rows = sqlx::query_as::<_, PackageVersionRow>(&select_sql(
            "WHERE enabled = true ORDER BY package, created_at",
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(PackageVersion::from).collect())
    }
}
