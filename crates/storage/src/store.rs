use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;
use versa_core::{Resource, ResourceTypeDescriptor, TypeRegistry};

use crate::error::StorageError;
use crate::query::CompiledQuery;
use crate::sqlite::is_read_only;
use crate::state::{DeletePlan, IdState, StateViolation};
use crate::traits::{SearchPage, VersionRow, VersionedStore};

/// Hands out a `TypedStore` per registered resource type.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    registry: Arc<TypeRegistry>,
}

impl ResourceStore {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn for_type(&self, resource_type: &str) -> Result<TypedStore<'_>, StorageError> {
        self.registry
            .get(resource_type)
            .map(TypedStore::new)
            .ok_or_else(|| StorageError::UnknownResourceType(resource_type.to_string()))
    }
}

pub struct TypedStore<'a> {
    descriptor: &'a ResourceTypeDescriptor,
}

struct RawRow {
    id: String,
    version: i64,
    payload: String,
    last_modified: String,
    deleted: bool,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            version: row.get(1)?,
            payload: row.get(2)?,
            last_modified: row.get(3)?,
            deleted: row.get(4)?,
        })
    }

    /// Columns are authoritative over whatever envelope the payload carries.
    fn decode(self) -> Result<VersionRow, StorageError> {
        let mut resource = Resource::from_json(&self.payload)?;
        let last_modified = DateTime::parse_from_rfc3339(&self.last_modified)
            .map_err(|e| StorageError::Serialization(format!("invalid last_modified: {e}")))?
            .with_timezone(&Utc);
        resource.stamp(self.id, to_version(self.version)?, last_modified);
        Ok(VersionRow {
            resource,
            deleted: self.deleted,
        })
    }
}

const ROW_COLUMNS: &str = "r.id, r.version, r.payload, r.last_modified, (r.deleted IS NOT NULL)";

impl<'a> TypedStore<'a> {
    pub fn new(descriptor: &'a ResourceTypeDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &ResourceTypeDescriptor {
        self.descriptor
    }

    fn table(&self) -> &str {
        &self.descriptor.table
    }

    fn state(&self, conn: &Connection, id: &str) -> Result<IdState, StorageError> {
        let row: Option<(i64, bool)> = conn
            .query_row(
                &format!(
                    "SELECT version, (deleted IS NOT NULL) FROM {} WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                    self.table()
                ),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            None => IdState::Absent,
            Some((latest, false)) => IdState::Active {
                latest: to_version(latest)?,
            },
            Some((latest, true)) => IdState::Deleted {
                latest: to_version(latest)?,
            },
        })
    }

    fn violation(&self, id: &str, violation: StateViolation) -> StorageError {
        match violation {
            StateViolation::NotFound => self.not_found(id),
            StateViolation::AlreadyExists => StorageError::ConstraintViolation(format!(
                "{}/{id} already exists",
                self.descriptor.name
            )),
            StateViolation::VersionMismatch { expected, actual } => StorageError::VersionConflict {
                resource_type: self.descriptor.name.clone(),
                id: id.to_string(),
                expected,
                actual,
            },
        }
    }

    fn not_found(&self, id: &str) -> StorageError {
        StorageError::NotFound {
            resource_type: self.descriptor.name.clone(),
            id: id.to_string(),
        }
    }

    fn check_type(&self, resource: &Resource) -> Result<(), StorageError> {
        if resource.resource_type != self.descriptor.name {
            return Err(StorageError::InvalidResource(format!(
                "expected {}, got {}",
                self.descriptor.name, resource.resource_type
            )));
        }
        Ok(())
    }

    fn insert_row(&self, conn: &Connection, resource: &Resource) -> Result<(), StorageError> {
        let (id, version, last_modified) = envelope(resource)?;
        let result = conn.execute(
            &format!(
                "INSERT INTO {} (id, version, payload, last_modified, deleted) VALUES (?1, ?2, ?3, ?4, NULL)",
                self.table()
            ),
            params![id, version as i64, resource.to_json()?, timestamp(last_modified)],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::ConstraintViolation(format!(
                    "{}/{id} version {version} already exists",
                    self.descriptor.name
                )))
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn query_rows(
        &self,
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<VersionRow>, StorageError> {
        let mut stmt = conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::decode).collect()
    }

    fn search_where(&self, query: &CompiledQuery) -> String {
        let mut clauses = vec![
            "r.deleted IS NULL".to_string(),
            format!(
                "r.version = (SELECT MAX(v.version) FROM {} v WHERE v.id = r.id)",
                self.table()
            ),
        ];
        clauses.extend(query.predicates.iter().map(|p| format!("({p})")));
        clauses.join(" AND ")
    }
}

impl VersionedStore for TypedStore<'_> {
    fn resource_type(&self) -> &str {
        &self.descriptor.name
    }

    fn create(&self, conn: &Connection, mut resource: Resource, id: &str) -> Result<Resource, StorageError> {
        self.check_type(&resource)?;
        let version = self
            .state(conn, id)?
            .on_create()
            .map_err(|v| self.violation(id, v))?;
        resource.stamp(id, version, Utc::now());
        self.insert_row(conn, &resource)?;
        debug!(target: "versa::store", resource_type = %self.descriptor.name, id, "created");
        Ok(resource)
    }

    fn read(&self, conn: &Connection, id: &str) -> Result<Option<Resource>, StorageError> {
        match self.read_including_deleted(conn, id)? {
            None => Ok(None),
            Some(row) if row.deleted => Err(StorageError::Deleted {
                resource_type: self.descriptor.name.clone(),
                id: id.to_string(),
                version: row.resource.version().unwrap_or_default(),
            }),
            Some(row) => Ok(Some(row.resource)),
        }
    }

    fn read_version(&self, conn: &Connection, id: &str, version: u64) -> Result<Option<Resource>, StorageError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} r WHERE r.id = ?1 AND r.version = ?2",
            self.table()
        );
        Ok(self
            .query_rows(conn, &sql, params![id, version as i64])?
            .into_iter()
            .next()
            .map(|row| row.resource))
    }

    fn read_including_deleted(&self, conn: &Connection, id: &str) -> Result<Option<VersionRow>, StorageError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} r WHERE r.id = ?1 ORDER BY r.version DESC LIMIT 1",
            self.table()
        );
        Ok(self.query_rows(conn, &sql, params![id])?.into_iter().next())
    }

    fn history(&self, conn: &Connection, id: &str) -> Result<Vec<VersionRow>, StorageError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} r WHERE r.id = ?1 ORDER BY r.version",
            self.table()
        );
        self.query_rows(conn, &sql, params![id])
    }

    fn exists_live(&self, conn: &Connection, id: &str, version: Option<u64>) -> Result<bool, StorageError> {
        let state = self.state(conn, id)?;
        Ok(match (state, version) {
            (IdState::Active { .. }, None) => true,
            (IdState::Active { latest }, Some(v)) => v >= 1 && v <= latest,
            _ => false,
        })
    }

    fn update(&self, conn: &Connection, mut resource: Resource, expected_version: Option<u64>) -> Result<Resource, StorageError> {
        require_write_transaction(conn)?;
        self.check_type(&resource)?;
        let id = resource
            .id
            .clone()
            .ok_or_else(|| StorageError::InvalidResource("update requires a resource id".into()))?;

        let plan = self
            .state(conn, &id)?
            .on_update(expected_version)
            .map_err(|v| self.violation(&id, v))?;

        if plan.resurrect {
            conn.execute(
                &format!("UPDATE {} SET deleted = NULL WHERE id = ?1", self.table()),
                params![id],
            )?;
            debug!(target: "versa::store", resource_type = %self.descriptor.name, id = %id, "resurrected");
        }

        resource.stamp(id.clone(), plan.version, Utc::now());
        self.insert_row(conn, &resource)?;
        debug!(
            target: "versa::store",
            resource_type = %self.descriptor.name,
            id = %id,
            version = plan.version,
            "updated"
        );
        Ok(resource)
    }

    fn update_in_place(&self, conn: &Connection, resource: &Resource) -> Result<(), StorageError> {
        require_write_transaction(conn)?;
        self.check_type(resource)?;
        let (id, version, _) = envelope(resource)?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET payload = ?1 WHERE id = ?2 AND version = ?3 AND deleted IS NULL",
                self.table()
            ),
            params![resource.to_json()?, id, version as i64],
        )?;
        if changed == 0 {
            return Err(self.not_found(id));
        }
        Ok(())
    }

    fn delete(&self, conn: &Connection, id: &str) -> Result<bool, StorageError> {
        require_write_transaction(conn)?;
        let plan = self
            .state(conn, id)?
            .on_delete()
            .map_err(|v| self.violation(id, v))?;
        match plan {
            DeletePlan::AlreadyDeleted => Ok(false),
            DeletePlan::Tombstone => {
                conn.execute(
                    &format!("UPDATE {} SET deleted = ?1 WHERE id = ?2", self.table()),
                    params![timestamp(Utc::now()), id],
                )?;
                debug!(target: "versa::store", resource_type = %self.descriptor.name, id, "deleted");
                Ok(true)
            }
        }
    }

    fn count(&self, conn: &Connection, query: &CompiledQuery) -> Result<usize, StorageError> {
        self.check_query(query)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} r WHERE {}",
            self.table(),
            self.search_where(query)
        );
        let count: i64 = conn.query_row(&sql, params_from_iter(query.params.iter()), |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn search(&self, conn: &Connection, query: &CompiledQuery) -> Result<SearchPage, StorageError> {
        let total = self.count(conn, query)?;
        if query.count == 0 || total == 0 {
            return Ok(SearchPage {
                total,
                resources: Vec::new(),
            });
        }

        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} r WHERE {} ORDER BY r.last_modified, r.id LIMIT {} OFFSET {}",
            self.table(),
            self.search_where(query),
            query.count,
            query.offset()
        );
        let resources = self
            .query_rows(conn, &sql, params_from_iter(query.params.iter()))?
            .into_iter()
            .map(|row| row.resource)
            .collect();
        Ok(SearchPage { total, resources })
    }
}

impl TypedStore<'_> {
    fn check_query(&self, query: &CompiledQuery) -> Result<(), StorageError> {
        if query.resource_type != self.descriptor.name {
            return Err(StorageError::InvalidResource(format!(
                "query compiled for {} run against {}",
                query.resource_type, self.descriptor.name
            )));
        }
        Ok(())
    }
}

/// Mutations must run inside an open, writable transaction. SQLite
/// transactions are serializable, which satisfies repeatable read.
fn require_write_transaction(conn: &Connection) -> Result<(), StorageError> {
    if conn.is_autocommit() {
        return Err(StorageError::IllegalState(
            "connection is in autocommit mode, an open transaction is required".into(),
        ));
    }
    if is_read_only(conn)? {
        return Err(StorageError::IllegalState("connection is read-only".into()));
    }
    Ok(())
}

fn envelope(resource: &Resource) -> Result<(&str, u64, DateTime<Utc>), StorageError> {
    match (&resource.id, resource.version(), resource.last_modified()) {
        (Some(id), Some(version), Some(at)) => Ok((id.as_str(), version, at)),
        _ => Err(StorageError::InvalidResource(
            "stored resources need an id, versionId and lastUpdated".into(),
        )),
    }
}

fn to_version(raw: i64) -> Result<u64, StorageError> {
    u64::try_from(raw).map_err(|_| StorageError::Serialization(format!("invalid version {raw}")))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
