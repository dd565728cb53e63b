//! SQL DDL for the blum record store.
//! WAL mode is enabled at connection time; a killed process leaves either
//! the last committed state or the one before it, never a torn record.

pub const SCHEMA_VERSION: u32 = 1;

/// `deleted` rows are tombstones: they keep the version counter so a
/// recreated key never reuses a version a stale writer might still hold.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS records (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB,
    version INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
";

pub const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";
