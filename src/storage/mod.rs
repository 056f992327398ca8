mod repository;

pub use repository::*;

/// SQL migration for the subscription ledger schema
pub const MIGRATION_001_LEDGER: &str = include_str!("migrations/001_ledger.sql");

/// SQL migration for the reference token tables
pub const MIGRATION_002_TOKEN: &str = include_str!("migrations/002_token.sql");
