//! Command-line interface for package version maintenance.
//!
//! Mirrors the administrative actions available on package versions so
//! they can be run from scripts and cron without the web console.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::version::{FieldValue, VersionEdit, VersionField};

/// Package version lifecycle CLI
#[derive(Parser, Debug)]
#[command(name = "repo-keeper")]
#[command(about = "Manage package versions of a Cydia/APT repository", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    /// Return as soon as background jobs are queued instead of waiting
    #[arg(long, global = true)]
    pub no_wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mark versions as enabled
    Enable {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Mark versions as disabled
    Disable {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Recompute stored digests on the high lane
    RefreshHashes {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Edit fields of a version (e.g. --set description="New text")
    Edit {
        id: Uuid,

        /// Field assignment, repeatable
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        assignments: Vec<String>,
    },

    /// Replace the stored file of a version
    ReplaceStorage {
        id: Uuid,

        /// Path of the new .deb file
        #[arg(long)]
        file: PathBuf,
    },

    /// Delete versions together with their stored files
    Delete {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Print the public link to a version's stored file
    Link { id: Uuid },

    /// Show a version
    Show { id: Uuid },
}

/// Parse one `field=value` assignment.
pub fn parse_assignment(raw: &str) -> Result<(VersionField, FieldValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| AppError::Validation(format!("Expected FIELD=VALUE, got '{}'", raw)))?;
    let field: VersionField = name.trim().parse()?;
    let value = field.parse_value(value)?;
    Ok((field, value))
}

/// Build an edit from repeated `--set` arguments.
pub fn build_edit(assignments: &[String]) -> Result<VersionEdit> {
    assignments
        .iter()
        .try_fold(VersionEdit::new(), |edit, raw| {
            let (field, value) = parse_assignment(raw)?;
            Ok(edit.set(field, value))
        })
}

/// Print a result in the selected format.
pub fn output(format: OutputFormat, message: &str, json_value: Option<serde_json::Value>) {
    match format {
        OutputFormat::Json => {
            let value = json_value.unwrap_or_else(|| serde_json::json!({ "message": message }));
            println!(
                "{}",
                serde_json::to_string_pretty(&value).unwrap_or_default()
            );
        }
        OutputFormat::Text => println!("{}", message),
    }
}

/// Print an error in the selected format.
pub fn error(format: OutputFormat, err: &AppError) {
    match format {
        OutputFormat::Json => {
            eprintln!(
                "{}",
                serde_json::json!({ "error": err.code(), "message": err.to_string() })
            );
        }
        OutputFormat::Text => eprintln!("Error: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edit_command() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "repo-keeper",
            "--format",
            "json",
            "edit",
            &id.to_string(),
            "--set",
            "description=Better tweak",
            "--set",
            "os_compatibility=1, 3",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Command::Edit { id: parsed, assignments } => {
                assert_eq!(parsed, id);
                assert_eq!(assignments.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bulk_commands_require_ids() {
        assert!(Cli::try_parse_from(["repo-keeper", "enable"]).is_err());
        assert!(Cli::try_parse_from(["repo-keeper", "delete", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_parse_assignment() {
        let (field, value) = parse_assignment("installed_size=42").unwrap();
        assert_eq!(field, VersionField::InstalledSize);
        assert_eq!(value, FieldValue::Int(Some(42)));

        let (field, value) = parse_assignment("homepage=").unwrap();
        assert_eq!(field, VersionField::Homepage);
        assert_eq!(value, FieldValue::Text(None));
    }

    #[test]
    fn test_parse_assignment_rejects_malformed() {
        assert!(matches!(
            parse_assignment("description"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            parse_assignment("nonsense=1"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            parse_assignment("enabled=maybe"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_build_edit() {
        let edit = build_edit(&["name=Tweak".to_string(), "enabled=false".to_string()]).unwrap();
        assert!(!edit.is_empty());
        assert!(build_edit(&["bogus".to_string()]).is_err());
    }
}
