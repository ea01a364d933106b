//! Database Schema Definitions
//!
//! Versioned migrations for the local store. Each entry is applied once, in
//! order, and recorded in `schema_migrations`.

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Migration scripts by version
pub const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("schema.sql"))];

/// Check if database needs migration
pub fn needs_migration(current_version: i64) -> bool {
    current_version < CURRENT_SCHEMA_VERSION
}

/// Migrations newer than `current_version`
pub fn pending_migrations(current_version: i64) -> impl Iterator<Item = &'static (i64, &'static str)> {
    MIGRATIONS.iter().filter(move |(v, _)| *v > current_version)
}
