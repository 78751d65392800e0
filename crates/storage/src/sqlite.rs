use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use versa_core::TypeRegistry;

use crate::error::StorageError;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Owns the SQLite connection a bundle execution runs on.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>, registry: &TypeRegistry) -> Result<Self, StorageError> {
        Self::open_with_timeout(path, registry, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(
        path: impl AsRef<Path>,
        registry: &TypeRegistry,
        busy_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn, registry, busy_timeout)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory(registry: &TypeRegistry) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn, registry, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

pub fn is_read_only(conn: &Connection) -> Result<bool, StorageError> {
    Ok(conn.pragma_query_value(None, "query_only", |row| row.get::<_, bool>(0))?)
}

pub fn set_read_only(conn: &Connection, read_only: bool) -> Result<(), StorageError> {
    conn.pragma_update(None, "query_only", read_only)?;
    Ok(())
}
