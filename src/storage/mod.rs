mod blobs;
mod feed;
mod repository;

pub use blobs::*;
pub use feed::*;
pub use repository::*;

/// SQL migration for the marketplace schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");
