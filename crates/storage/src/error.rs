use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    #[error("deleted: {resource_type}/{id} (version {version})")]
    Deleted {
        resource_type: String,
        id: String,
        version: u64,
    },

    #[error("version conflict on {resource_type}/{id}: expected {expected}, current {actual}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("illegal connection state: {0}")]
    IllegalState(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("core error: {0}")]
    Core(#[from] versa_core::CoreError),
}
