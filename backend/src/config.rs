//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use crate::services::task_queue::HIGH_LANE;
use std::env;

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    /// Storage backend: only "filesystem" is supported
    pub storage_backend: String,

    /// Filesystem storage path (when storage_backend = "filesystem")
    pub storage_path: String,

    /// Base URL under which stored package files are published
    pub public_base_url: String,

    /// Task queue lanes started at boot, in priority order
    pub task_lanes: Vec<String>,

    /// Buffer size of the notification event bus
    pub event_bus_capacity: usize,
}

redacted_debug!(Config {
    redact database_url,
    show log_level,
    show storage_backend,
    show storage_path,
    show public_base_url,
    show task_lanes,
    show event_bus_capacity,
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let task_lanes =
            parse_lanes(&env::var("TASK_LANES").unwrap_or_else(|_| "high,default,low".into()))?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            storage_backend: env::var("STORAGE_BACKEND").unwrap_or_else(|_| "filesystem".into()),
            storage_path: env::var("STORAGE_PATH")
                .unwrap_or_else(|_| "/var/lib/repo-keeper/storage".into()),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/storage".into()),
            task_lanes,
            event_bus_capacity: env::var("EVENT_BUS_CAPACITY")
                .unwrap_or_else(|_| "256".into())
                .parse()
                .unwrap_or(256),
        })
    }
}

/// Parse a comma-separated lane list. The "high" lane is mandatory since
/// hash refresh and storage update jobs are always submitted there.
pub fn parse_lanes(raw: &str) -> Result<Vec<String>> {
    let mut lanes: Vec<String> = Vec::new();
    for lane in raw.split(',').map(str::trim).filter(|l| !l.is_empty()) {
        if !lanes.iter().any(|l| l == lane) {
            lanes.push(lane.to_string());
        }
    }

    if !lanes.iter().any(|l| l == HIGH_LANE) {
        return Err(AppError::Config(format!(
            "TASK_LANES must include the \"{}\" lane",
            HIGH_LANE
        )));
    }

    Ok(lanes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lanes_trims_and_dedups() {
        let lanes = parse_lanes(" high, low ,high,,default").unwrap();
        assert_eq!(lanes, vec!["high", "low", "default"]);
    }

    #[test]
    fn test_parse_lanes_requires_high() {
        let err = parse_lanes("default,low").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_database_url() {
        let config = Config {
            database_url: "postgres://keeper:hunter2@db/repo".into(),
            log_level: "info".into(),
            storage_backend: "filesystem".into(),
            storage_path: "/tmp/storage".into(),
            public_base_url: "https://repo.example.com/storage".into(),
            task_lanes: vec!["high".into()],
            event_bus_capacity: 16,
        };
        let output = format!("{:?}", config);
        assert!(!output.contains("hunter2"));
        assert!(output.contains("repo.example.com"));
    }
}
