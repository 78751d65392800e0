use rusqlite::Connection;
use versa_core::Resource;

use crate::error::StorageError;
use crate::query::CompiledQuery;

/// A stored version row together with the id-level tombstone flag.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub resource: Resource,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub total: usize,
    pub resources: Vec<Resource>,
}

/// Versioned, soft-deleting storage for one resource type.
///
/// Mutating calls other than `create` require `conn` to be inside an open,
/// writable transaction and fail with `IllegalState` otherwise.
pub trait VersionedStore {
    fn resource_type(&self) -> &str;

    /// Inserts `resource` as version 1 under `id`.
    fn create(&self, conn: &Connection, resource: Resource, id: &str) -> Result<Resource, StorageError>;

    /// The current row. Tombstoned ids fail with `Deleted`.
    fn read(&self, conn: &Connection, id: &str) -> Result<Option<Resource>, StorageError>;

    fn read_version(&self, conn: &Connection, id: &str, version: u64) -> Result<Option<Resource>, StorageError>;

    fn read_including_deleted(&self, conn: &Connection, id: &str) -> Result<Option<VersionRow>, StorageError>;

    fn history(&self, conn: &Connection, id: &str) -> Result<Vec<VersionRow>, StorageError>;

    /// True if `id` exists and is not tombstoned, and `version` (if given) exists.
    fn exists_live(&self, conn: &Connection, id: &str, version: Option<u64>) -> Result<bool, StorageError>;

    /// Appends a new version. A tombstoned id is resurrected.
    fn update(&self, conn: &Connection, resource: Resource, expected_version: Option<u64>) -> Result<Resource, StorageError>;

    /// Rewrites the payload of the live row at the resource's version without
    /// adding a new version.
    fn update_in_place(&self, conn: &Connection, resource: &Resource) -> Result<(), StorageError>;

    /// Tombstones every row of `id`. Returns false if it already was.
    fn delete(&self, conn: &Connection, id: &str) -> Result<bool, StorageError>;

    fn count(&self, conn: &Connection, query: &CompiledQuery) -> Result<usize, StorageError>;

    fn search(&self, conn: &Connection, query: &CompiledQuery) -> Result<SearchPage, StorageError>;
}
