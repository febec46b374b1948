//! Domain models.

pub mod version;
