use std::path::{Path, PathBuf};

use tempfile::TempDir;
use versa_core::TypeRegistry;
use versa_engine::{EngineConfig, EngineError};
use versa_storage::SqliteStorage;

use crate::server::TestServer;

/// An on-disk database that several servers can open at once, each with its
/// own connection.
pub struct SharedDatabase {
    _dir: TempDir,
    path: PathBuf,
}

impl SharedDatabase {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("versa.db");
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage.path = self.path.to_string_lossy().into_owned();
        config
    }

    pub fn open_server(&self) -> Result<TestServer, EngineError> {
        TestServer::with_config(self.config())
    }

    /// A bare connection for store-level tests.
    pub fn open_storage(&self) -> Result<SqliteStorage, EngineError> {
        Ok(SqliteStorage::open(&self.path, &TypeRegistry::standard())?)
    }
}
