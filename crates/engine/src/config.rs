//! Engine configuration via `versa.toml`.
//!
//! Every key has a default, so an empty file (or no file) yields a working
//! in-memory store at `http://localhost/fhir`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;

/// Config file name used by `write_default_if_missing`.
pub const CONFIG_FILE_NAME: &str = "versa.toml";

/// Path value that selects an in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// SQLite database file, or `":memory:"`.
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// How long a writer waits for a competing transaction, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_storage_path() -> String {
    IN_MEMORY_PATH.to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Engine configuration loaded from `versa.toml`.
///
/// # Example
///
/// ```toml
/// server_base = "https://store.example.org/fhir"
/// check_references = true
///
/// [storage]
/// path = "/var/lib/versa/versa.db"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// This store's own base location. Literal references under it are
    /// internal; everything else is external.
    #[serde(default = "default_server_base")]
    pub server_base: String,
    /// Prefix marking bundle-local placeholder references.
    #[serde(default = "default_temporary_prefix")]
    pub temporary_prefix: String,
    /// Page size for conditional reads without `_count`.
    #[serde(default = "default_page_count")]
    pub default_page_count: usize,
    /// Append a CheckReferences command after every reference resolution.
    #[serde(default = "default_true")]
    pub check_references: bool,
    /// Reject unsupported search parameters on conditional reads instead of
    /// ignoring them.
    #[serde(default = "default_true")]
    pub strict_search_handling: bool,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_server_base() -> String {
    "http://localhost/fhir".to_string()
}

fn default_temporary_prefix() -> String {
    "urn:uuid:".to_string()
}

fn default_page_count() -> usize {
    20
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_base: default_server_base(),
            temporary_prefix: default_temporary_prefix(),
            default_page_count: default_page_count(),
            check_references: true,
            strict_search_handling: true,
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_server_base(mut self, server_base: &str) -> Self {
        self.server_base = server_base.to_string();
        self
    }

    /// # Errors
    ///
    /// Returns an error if `server_base` is not an http(s) URL without a
    /// trailing slash, or if the temporary prefix is empty.
    pub fn validate(&self) -> Result<(), EngineError> {
        let base = self.server_base.as_str();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(EngineError::Config(format!(
                "server_base must be an http(s) url, got '{base}'"
            )));
        }
        if base.ends_with('/') {
            return Err(EngineError::Config(format!(
                "server_base must not end with '/', got '{base}'"
            )));
        }
        if self.temporary_prefix.is_empty() {
            return Err(EngineError::Config("temporary_prefix must not be empty".into()));
        }
        if self.default_page_count == 0 {
            return Err(EngineError::Config("default_page_count must be positive".into()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Versa resource store configuration
#
# Base location of this store. Literal references starting with it are
# treated as internal and verified against the database.
server_base = "http://localhost/fhir"

# Prefix of bundle-local placeholder references (entry fullUrl values).
temporary_prefix = "urn:uuid:"

# Page size for conditional reads that do not pass _count.
default_page_count = 20

# Verify every reference again after resolution, before commit.
check_references = true

# Reject unsupported search parameters on conditional reads (true) or
# ignore them with a warning (false).
strict_search_handling = true

[storage]
# SQLite database file, or ":memory:"
path = ":memory:"
busy_timeout_ms = 5000
"#
    }

    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            EngineError::Config(message) => {
                EngineError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                EngineError::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), EngineError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
