//! Business logic services.

pub mod event_bus;
pub mod hash_service;
pub mod jobs;
pub mod lifecycle_service;
pub mod link_service;
pub mod task_queue;
pub mod version_store;
