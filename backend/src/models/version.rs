//! Package version model.
//!
//! A package version is one distributable build of a package together with the
//! blob that holds its `.deb` file. Digests and size describe that blob and are
//! cleared whenever the blob is replaced.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Content digests of a stored blob, always computed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
    pub size: i64,
}

/// Package version entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub id: Uuid,
    pub enabled: bool,
    pub package: String,
    pub version: String,

    pub name: String,
    pub section: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
    pub update_logs: Option<String>,

    pub custom_depiction: Option<String>,
    pub depiction: Option<String>,
    pub homepage: Option<String>,

    pub maintainer_name: Option<String>,
    pub maintainer_email: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub sponsor_name: Option<String>,
    pub sponsor_site: Option<String>,

    pub architecture: Option<String>,
    pub priority: Option<String>,
    pub essential: Option<String>,
    pub tag: Option<String>,

    pub depends: Option<String>,
    pub pre_depends: Option<String>,
    pub conflicts: Option<String>,
    pub replaces: Option<String>,
    pub provides: Option<String>,
    pub recommends: Option<String>,
    pub suggests: Option<String>,
    pub breaks: Option<String>,

    pub origin: Option<String>,
    pub source: Option<String>,
    pub bugs: Option<String>,
    pub installer_menu_item: Option<String>,
    pub build_essential: Option<String>,
    pub built_using: Option<String>,
    pub built_for_profiles: Option<String>,
    pub multi_arch: Option<String>,
    pub subarchitecture: Option<String>,
    pub kernel_version: Option<String>,

    pub os_compatibility: BTreeSet<i32>,
    pub device_compatibility: BTreeSet<i32>,

    /// `None` while the blob has changed and digests are not yet recomputed.
    pub digests: Option<Digests>,
    pub installed_size: Option<i64>,
    pub storage_key: String,
    pub download_times: i64,
    pub created_at: DateTime<Utc>,
}

impl PackageVersion {
    /// Build a freshly ingested version pointing at `storage_key`.
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        storage_key: impl Into<String>,
    ) -> Self {
        let package = package.into();
        Self {
            id: Uuid::new_v4(),
            enabled: true,
            name: package.clone(),
            package,
            version: version.into(),
            section: None,
            icon: None,
            description: None,
            update_logs: None,
            custom_depiction: None,
            depiction: None,
            homepage: None,
            maintainer_name: None,
            maintainer_email: None,
            author_name: None,
            author_email: None,
            sponsor_name: None,
            sponsor_site: None,
            architecture: None,
            priority: None,
            essential: None,
            tag: None,
            depends: None,
            pre_depends: None,
            conflicts: None,
            replaces: None,
            provides: None,
            recommends: None,
            suggests: None,
            breaks: None,
            origin: None,
            source: None,
            bugs: None,
            installer_menu_item: None,
            build_essential: None,
            built_using: None,
            built_for_profiles: None,
            multi_arch: None,
            subarchitecture: None,
            kernel_version: None,
            os_compatibility: BTreeSet::new(),
            device_compatibility: BTreeSet::new(),
            digests: None,
            installed_size: None,
            storage_key: storage_key.into(),
            download_times: 0,
            created_at: Utc::now(),
        }
    }

    /// Storage key the version is relocated to by a storage update:
    /// `versions/<id>/<package>_<version>_<architecture>.deb`.
    pub fn canonical_storage_key(&self) -> String {
        format!(
            "versions/{}/{}_{}_{}.deb",
            self.id,
            path_safe(&self.package),
            path_safe(&self.version),
            path_safe(self.architecture.as_deref().unwrap_or("all")),
        )
    }

    /// Assign `value` to `field`. Returns whether the stored value changed.
    ///
    /// Computed columns (storage, digests, size, download counter, creation
    /// time) cannot be assigned.
    pub fn apply(&mut self, field: VersionField, value: FieldValue) -> Result<bool> {
        use VersionField as F;

        if field.is_computed() {
            return Err(AppError::Validation(format!("{} is read-only", field)));
        }

        match (field, value) {
            (F::Enabled, FieldValue::Bool(v)) => Ok(assign(&mut self.enabled, v)),
            (F::Package | F::Version | F::Name, FieldValue::Text(None)) => {
                Err(AppError::Validation(format!("{} must not be empty", field)))
            }
            (F::Package, FieldValue::Text(Some(v))) => Ok(assign(&mut self.package, v)),
            (F::Version, FieldValue::Text(Some(v))) => Ok(assign(&mut self.version, v)),
            (F::Name, FieldValue::Text(Some(v))) => Ok(assign(&mut self.name, v)),
            (F::InstalledSize, FieldValue::Int(v)) => Ok(assign(&mut self.installed_size, v)),
            (F::OsCompatibility, FieldValue::IdSet(v)) => {
                Ok(assign(&mut self.os_compatibility, v))
            }
            (F::DeviceCompatibility, FieldValue::IdSet(v)) => {
                Ok(assign(&mut self.device_compatibility, v))
            }
            (f, FieldValue::Text(v)) => match self.optional_text_mut(f) {
                Some(slot) => Ok(assign(slot, v)),
                None => Err(type_mismatch(f, "text")),
            },
            (f, value) => Err(type_mismatch(f, value.kind())),
        }
    }

    fn optional_text_mut(&mut self, field: VersionField) -> Option<&mut Option<String>> {
        use VersionField as F;
        let slot = match field {
            F::Section => &mut self.section,
            F::Icon => &mut self.icon,
            F::Description => &mut self.description,
            F::UpdateLogs => &mut self.update_logs,
            F::CustomDepiction => &mut self.custom_depiction,
            F::Depiction => &mut self.depiction,
            F::Homepage => &mut self.homepage,
            F::MaintainerName => &mut self.maintainer_name,
            F::MaintainerEmail => &mut self.maintainer_email,
            F::AuthorName => &mut self.author_name,
            F::AuthorEmail => &mut self.author_email,
            F::SponsorName => &mut self.sponsor_name,
            F::SponsorSite => &mut self.sponsor_site,
            F::Architecture => &mut self.architecture,
            F::Priority => &mut self.priority,
            F::Essential => &mut self.essential,
            F::Tag => &mut self.tag,
            F::Depends => &mut self.depends,
            F::PreDepends => &mut self.pre_depends,
            F::Conflicts => &mut self.conflicts,
            F::Replaces => &mut self.replaces,
            F::Provides => &mut self.provides,
            F::Recommends => &mut self.recommends,
            F::Suggests => &mut self.suggests,
            F::Breaks => &mut self.breaks,
            F::Origin => &mut self.origin,
            F::Source => &mut self.source,
            F::Bugs => &mut self.bugs,
            F::InstallerMenuItem => &mut self.installer_menu_item,
            F::BuildEssential => &mut self.build_essential,
            F::BuiltUsing => &mut self.built_using,
            F::BuiltForProfiles => &mut self.built_for_profiles,
            F::MultiArch => &mut self.multi_arch,
            F::Subarchitecture => &mut self.subarchitecture,
            F::KernelVersion => &mut self.kernel_version,
            _ => return None,
        };
        Some(slot)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.package, self.version)
    }
}

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn type_mismatch(field: VersionField, kind: &str) -> AppError {
    AppError::Validation(format!("{} does not accept a {} value", field, kind))
}

fn path_safe(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' => '_',
            c => c,
        })
        .collect()
}

/// Column of a package version, by canonical snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionField {
    Enabled,
    Package,
    Version,
    Name,
    Section,
    Icon,
    Description,
    UpdateLogs,
    CustomDepiction,
    Depiction,
    Homepage,
    OsCompatibility,
    DeviceCompatibility,
    MaintainerName,
    MaintainerEmail,
    AuthorName,
    AuthorEmail,
    SponsorName,
    SponsorSite,
    Architecture,
    Priority,
    Essential,
    Tag,
    Depends,
    PreDepends,
    Conflicts,
    Replaces,
    Provides,
    Recommends,
    Suggests,
    Breaks,
    Origin,
    Source,
    Bugs,
    InstallerMenuItem,
    BuildEssential,
    BuiltUsing,
    BuiltForProfiles,
    MultiArch,
    Subarchitecture,
    KernelVersion,
    Storage,
    Md5,
    Sha1,
    Sha256,
    Sha512,
    Size,
    InstalledSize,
    DownloadTimes,
    CreatedAt,
}

impl VersionField {
    pub const ALL: [VersionField; 50] = [
        Self::Enabled,
        Self::Package,
        Self::Version,
        Self::Name,
        Self::Section,
        Self::Icon,
        Self::Description,
        Self::UpdateLogs,
        Self::CustomDepiction,
        Self::Depiction,
        Self::Homepage,
        Self::OsCompatibility,
        Self::DeviceCompatibility,
        Self::MaintainerName,
        Self::MaintainerEmail,
        Self::AuthorName,
        Self::AuthorEmail,
        Self::SponsorName,
        Self::SponsorSite,
        Self::Architecture,
        Self::Priority,
        Self::Essential,
        Self::Tag,
        Self::Depends,
        Self::PreDepends,
        Self::Conflicts,
        Self::Replaces,
        Self::Provides,
        Self::Recommends,
        Self::Suggests,
        Self::Breaks,
        Self::Origin,
        Self::Source,
        Self::Bugs,
        Self::InstallerMenuItem,
        Self::BuildEssential,
        Self::BuiltUsing,
        Self::BuiltForProfiles,
        Self::MultiArch,
        Self::Subarchitecture,
        Self::KernelVersion,
        Self::Storage,
        Self::Md5,
        Self::Sha1,
        Self::Sha256,
        Self::Sha512,
        Self::Size,
        Self::InstalledSize,
        Self::DownloadTimes,
        Self::CreatedAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Package => "package",
            Self::Version => "version",
            Self::Name => "name",
            Self::Section => "section",
            Self::Icon => "icon",
            Self::Description => "description",
            Self::UpdateLogs => "update_logs",
            Self::CustomDepiction => "custom_depiction",
            Self::Depiction => "depiction",
            Self::Homepage => "homepage",
            Self::OsCompatibility => "os_compatibility",
            Self::DeviceCompatibility => "device_compatibility",
            Self::MaintainerName => "maintainer_name",
            Self::MaintainerEmail => "maintainer_email",
            Self::AuthorName => "author_name",
            Self::AuthorEmail => "author_email",
            Self::SponsorName => "sponsor_name",
            Self::SponsorSite => "sponsor_site",
            Self::Architecture => "architecture",
            Self::Priority => "priority",
            Self::Essential => "essential",
            Self::Tag => "tag",
            Self::Depends => "depends",
            Self::PreDepends => "pre_depends",
            Self::Conflicts => "conflicts",
            Self::Replaces => "replaces",
            Self::Provides => "provides",
            Self::Recommends => "recommends",
            Self::Suggests => "suggests",
            Self::Breaks => "breaks",
            Self::Origin => "origin",
            Self::Source => "source",
            Self::Bugs => "bugs",
            Self::InstallerMenuItem => "installer_menu_item",
            Self::BuildEssential => "build_essential",
            Self::BuiltUsing => "built_using",
            Self::BuiltForProfiles => "built_for_profiles",
            Self::MultiArch => "multi_arch",
            Self::Subarchitecture => "subarchitecture",
            Self::KernelVersion => "kernel_version",
            Self::Storage => "storage",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Size => "size",
            Self::InstalledSize => "installed_size",
            Self::DownloadTimes => "download_times",
            Self::CreatedAt => "created_at",
        }
    }

    /// Changes to exempt fields never require the stored package file to be
    /// rewritten.
    pub fn is_exempt(&self) -> bool {
        matches!(
            self,
            Self::Enabled
                | Self::CreatedAt
                | Self::OsCompatibility
                | Self::DeviceCompatibility
                | Self::UpdateLogs
                | Self::Storage
                | Self::Icon
                | Self::Md5
                | Self::Sha1
                | Self::Sha256
                | Self::Sha512
                | Self::Size
                | Self::DownloadTimes
        )
    }

    /// Columns maintained by the lifecycle core rather than by edits.
    pub fn is_computed(&self) -> bool {
        matches!(
            self,
            Self::Storage
                | Self::Md5
                | Self::Sha1
                | Self::Sha256
                | Self::Sha512
                | Self::Size
                | Self::DownloadTimes
                | Self::CreatedAt
        )
    }

    /// Parse a raw command-line value into the value kind this field takes.
    /// Empty text clears optional columns.
    pub fn parse_value(&self, raw: &str) -> Result<FieldValue> {
        let raw = raw.trim();
        match self {
            Self::Enabled => raw
                .parse::<bool>()
                .map(FieldValue::Bool)
                .map_err(|_| AppError::Validation(format!("{}: expected true or false", self))),
            Self::InstalledSize => {
                if raw.is_empty() {
                    return Ok(FieldValue::Int(None));
                }
                raw.parse::<i64>()
                    .map(|v| FieldValue::Int(Some(v)))
                    .map_err(|_| AppError::Validation(format!("{}: expected an integer", self)))
            }
            Self::OsCompatibility | Self::DeviceCompatibility => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<i32>().map_err(|_| {
                        AppError::Validation(format!("{}: '{}' is not an id", self, s))
                    })
                })
                .collect::<Result<BTreeSet<i32>>>()
                .map(FieldValue::IdSet),
            _ if raw.is_empty() => Ok(FieldValue::Text(None)),
            _ => Ok(FieldValue::Text(Some(raw.to_string()))),
        }
    }
}

impl fmt::Display for VersionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionField {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown field '{}'", s)))
    }
}

/// Value assigned to a field by an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(Option<i64>),
    IdSet(BTreeSet<i32>),
    Text(Option<String>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "boolean",
            FieldValue::Int(_) => "integer",
            FieldValue::IdSet(_) => "id set",
            FieldValue::Text(_) => "text",
        }
    }
}

/// Caller-side edit of a package version.
///
/// Applying the edit yields the set of fields whose value actually changed,
/// which is what `LifecycleService::save` uses to decide whether the stored
/// file must be rebuilt.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    assignments: Vec<(VersionField, FieldValue)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: VersionField, value: FieldValue) -> Self {
        self.assignments.push((field, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Apply all assignments in order and return the changed fields.
    pub fn apply_to(&self, version: &mut PackageVersion) -> Result<BTreeSet<VersionField>> {
        let mut changed = BTreeSet::new();
        for (field, value) in &self.assignments {
            if version.apply(*field, value.clone())? {
                changed.insert(*field);
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageVersion {
        let mut v = PackageVersion::new("com.example.tweak", "1.0-1", "uploads/tweak.deb");
        v.architecture = Some("iphoneos-arm".into());
        v
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in VersionField::ALL {
            assert_eq!(field.as_str().parse::<VersionField>().unwrap(), field);
        }
        assert!("c_md5".parse::<VersionField>().is_err());
    }

    #[test]
    fn test_exempt_fields() {
        let exempt: Vec<&str> = VersionField::ALL
            .iter()
            .filter(|f| f.is_exempt())
            .map(|f| f.as_str())
            .collect();
        assert_eq!(
            exempt,
            vec![
                "enabled",
                "icon",
                "update_logs",
                "os_compatibility",
                "device_compatibility",
                "storage",
                "md5",
                "sha1",
                "sha256",
                "sha512",
                "size",
                "download_times",
                "created_at",
            ]
        );
        assert!(!VersionField::Depends.is_exempt());
        assert!(!VersionField::InstalledSize.is_exempt());
    }

    #[test]
    fn test_control_fields_are_editable_and_not_exempt() {
        let mut v = sample();
        for name in [
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
        ] {
            let field: VersionField = name.parse().unwrap();
            assert!(!field.is_exempt(), "{} must trigger a storage update", name);
            assert!(v.apply(field, field.parse_value("x").unwrap()).unwrap());
        }
        assert_eq!(v.multi_arch.as_deref(), Some("x"));
        assert_eq!(v.kernel_version.as_deref(), Some("x"));
    }

    #[test]
    fn test_apply_reports_change_only_when_value_differs() {
        let mut v = sample();
        assert!(v
            .apply(VersionField::Section, FieldValue::Text(Some("Tweaks".into())))
            .unwrap());
        assert!(!v
            .apply(VersionField::Section, FieldValue::Text(Some("Tweaks".into())))
            .unwrap());
        assert_eq!(v.section.as_deref(), Some("Tweaks"));
    }

    #[test]
    fn test_apply_rejects_computed_fields() {
        let mut v = sample();
        let err = v
            .apply(VersionField::Storage, FieldValue::Text(Some("other.deb".into())))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(v.storage_key, "uploads/tweak.deb");
    }

    #[test]
    fn test_apply_rejects_wrong_kind_and_empty_identity() {
        let mut v = sample();
        assert!(v.apply(VersionField::Enabled, FieldValue::Int(Some(1))).is_err());
        assert!(v.apply(VersionField::Package, FieldValue::Text(None)).is_err());
        assert!(v
            .apply(VersionField::OsCompatibility, FieldValue::Text(Some("1".into())))
            .is_err());
    }

    #[test]
    fn test_edit_collects_changed_fields() {
        let mut v = sample();
        let edit = VersionEdit::new()
            .set(VersionField::Enabled, FieldValue::Bool(true))
            .set(VersionField::Depends, FieldValue::Text(Some("mobilesubstrate".into())))
            .set(VersionField::OsCompatibility, FieldValue::IdSet([1, 2].into()));
        let changed = edit.apply_to(&mut v).unwrap();
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![VersionField::OsCompatibility, VersionField::Depends]
        );
    }

    #[test]
    fn test_parse_value_by_field_kind() {
        assert_eq!(
            VersionField::Enabled.parse_value("false").unwrap(),
            FieldValue::Bool(false)
        );
        assert_eq!(
            VersionField::InstalledSize.parse_value("").unwrap(),
            FieldValue::Int(None)
        );
        assert_eq!(
            VersionField::DeviceCompatibility.parse_value("3, 1").unwrap(),
            FieldValue::IdSet([1, 3].into())
        );
        assert_eq!(
            VersionField::Homepage.parse_value(" ").unwrap(),
            FieldValue::Text(None)
        );
        assert!(VersionField::OsCompatibility.parse_value("ios12").is_err());
    }

    #[test]
    fn test_canonical_storage_key() {
        let v = sample();
        assert_eq!(
            v.canonical_storage_key(),
            format!("versions/{}/com.example.tweak_1.0-1_iphoneos-arm.deb", v.id)
        );

        let mut odd = sample();
        odd.architecture = None;
        odd.version = "2.0/beta".into();
        assert!(odd.canonical_storage_key().ends_with("_2.0_beta_all.deb"));
    }

    #[test]
    fn test_display() {
        assert_eq!(sample().to_string(), "com.example.tweak (1.0-1)");
    }
}
