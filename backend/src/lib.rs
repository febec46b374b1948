//! repo-keeper - Backend Library
//!
//! Package version lifecycle for a Cydia/APT repository: hashing, storage
//! links, background jobs and the state transitions around them.

#[macro_use]
mod macros;

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
