use std::time::Duration;

use rusqlite::Connection;
use versa_core::{ResourceTypeDescriptor, TypeRegistry};

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(
    conn: &Connection,
    registry: &TypeRegistry,
    busy_timeout: Duration,
) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
    ",
    )?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(SCHEMA_SQL)?;
    for descriptor in registry.descriptors() {
        conn.execute_batch(&version_table_sql(descriptor))?;
    }
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());
";

/// One append-only version table per resource type. `deleted` is an id-level
/// tombstone timestamp, kept identical across every row of an id.
fn version_table_sql(descriptor: &ResourceTypeDescriptor) -> String {
    let table = &descriptor.table;
    format!(
        "
CREATE TABLE IF NOT EXISTS {table} (
    id TEXT NOT NULL,
    version INTEGER NOT NULL CHECK (version >= 1),
    payload TEXT NOT NULL CHECK (json_valid(payload)),
    last_modified TEXT NOT NULL,
    deleted TEXT,
    PRIMARY KEY (id, version)
);
CREATE INDEX IF NOT EXISTS idx_{table}_live ON {table} (id, version) WHERE deleted IS NULL;
"
    )
}
