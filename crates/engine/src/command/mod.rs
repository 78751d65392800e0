mod create;
mod delete;
mod read;
mod references;
mod update;

pub use create::CreateCommand;
pub use delete::DeleteCommand;
pub use read::ReadCommand;
pub use references::{CheckReferencesCommand, ResolveReferencesCommand};
pub use update::UpdateCommand;

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::warn;
use versa_core::{QueryParams, ReferenceClassifier, Resource, ResponseEntry, ReturnPreference};
use versa_storage::{QueryCompiler, ResourceStore, SearchPage, TypedStore, VersionedStore};

use crate::access::{AccessRules, User};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::id_table::{IdTranslationTable, ResourceKey};

/// Collaborators shared by every command of one bundle execution.
pub struct ExecutionEnv<'a> {
    pub config: &'a EngineConfig,
    pub store: &'a ResourceStore,
    pub compiler: &'a dyn QueryCompiler,
    pub access: &'a dyn AccessRules,
    pub user: &'a User,
    pub preference: ReturnPreference,
}

impl<'a> ExecutionEnv<'a> {
    pub fn classifier(&self) -> ReferenceClassifier<'a> {
        ReferenceClassifier::new(
            self.store.registry(),
            &self.config.server_base,
            &self.config.temporary_prefix,
        )
    }

    pub fn typed(&self, resource_type: &str) -> Result<TypedStore<'a>, EngineError> {
        Ok(self.store.for_type(resource_type)?)
    }

    pub fn is_temporary(&self, reference: &str) -> bool {
        self.classifier().is_temporary(reference)
    }

    /// `{base}/{type}/{id}`
    pub fn full_url(&self, key: &ResourceKey) -> String {
        format!("{}/{}", self.config.server_base, key.literal())
    }

    /// `{base}/{type}/{id}/_history/{version}`
    pub fn location(&self, resource: &Resource) -> String {
        format!(
            "{}/{}/{}/_history/{}",
            self.config.server_base,
            resource.resource_type,
            resource.id.as_deref().unwrap_or_default(),
            resource.version().unwrap_or_default()
        )
    }

    /// Runs a filter-only search, as used by conditional operations and
    /// conditional references. Paging and formatting parameters are dropped;
    /// unsupported parameters are a bad request. At most `limit` matches are
    /// returned, but `total` is always exact.
    pub fn search_by_condition(
        &self,
        conn: &Connection,
        resource_type: &str,
        params: &QueryParams,
        limit: usize,
    ) -> Result<SearchPage, EngineError> {
        let store = self.typed(resource_type)?;
        let (filter, removed) = versa_storage::query::strip_standard_parameters(params);
        if !removed.is_empty() {
            warn!(
                target: "versa::command",
                resource_type,
                parameters = ?removed,
                "ignoring paging and formatting parameters in conditional operation"
            );
        }

        let mut query = self.compiler.compile(store.descriptor(), &filter);
        if query.has_errors() {
            return Err(EngineError::InvalidQuery {
                resource_type: resource_type.to_string(),
                errors: query.errors.iter().map(ToString::to_string).collect(),
            });
        }
        query.page = 1;
        query.count = limit;
        Ok(store.search(conn, &query)?)
    }
}

/// A row version written by a Create or Update of this bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub key: ResourceKey,
    pub version: u64,
}

impl Persisted {
    pub fn of(resource: &Resource) -> Result<Self, EngineError> {
        match (resource.id.as_deref(), resource.version()) {
            (Some(id), Some(version)) => Ok(Self {
                key: ResourceKey::new(&resource.resource_type, id),
                version,
            }),
            _ => Err(EngineError::Internal(format!(
                "store returned a {} without id or version",
                resource.resource_type
            ))),
        }
    }
}

/// Mutable state threaded through the phases of one bundle execution.
#[derive(Debug, Default)]
pub struct ExecutionState {
    pub ids: IdTranslationTable,
    persisted: BTreeMap<usize, Persisted>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the row a Create or Update at `index` wrote in this bundle.
    pub fn record_persisted(&mut self, index: usize, row: Persisted) {
        self.persisted.insert(index, row);
    }

    pub fn persisted(&self, index: usize) -> Option<&Persisted> {
        self.persisted.get(&index)
    }

    /// Drops what a rolled back batch entry recorded.
    pub fn forget(&mut self, index: usize) {
        self.persisted.remove(&index);
    }
}

#[derive(Debug)]
pub enum CommandKind {
    Delete(DeleteCommand),
    Create(CreateCommand),
    Update(UpdateCommand),
    ResolveReferences(ResolveReferencesCommand),
    CheckReferences(CheckReferencesCommand),
    Read(ReadCommand),
}

/// One unit of work derived from a bundle entry.
#[derive(Debug)]
pub struct Command {
    index: usize,
    kind: CommandKind,
}

impl Command {
    pub fn new(index: usize, kind: CommandKind) -> Self {
        Self { index, kind }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Lower runs first in a transaction.
    pub fn priority(&self) -> u8 {
        match self.kind {
            CommandKind::Delete(_) => 1,
            CommandKind::Create(_) => 2,
            CommandKind::Update(_) => 3,
            CommandKind::ResolveReferences(_) | CommandKind::CheckReferences(_) => 4,
            CommandKind::Read(_) => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            CommandKind::Delete(_) => "delete",
            CommandKind::Create(_) => "create",
            CommandKind::Update(_) => "update",
            CommandKind::ResolveReferences(_) => "resolve-references",
            CommandKind::CheckReferences(_) => "check-references",
            CommandKind::Read(_) => "read",
        }
    }

    /// True if executing this command may write to the store.
    pub fn is_modifying(&self) -> bool {
        !matches!(self.kind, CommandKind::Read(_) | CommandKind::CheckReferences(_))
    }

    pub fn pre_execute(&mut self, env: &ExecutionEnv<'_>, ids: &mut IdTranslationTable) -> Result<(), EngineError> {
        match &mut self.kind {
            CommandKind::Delete(c) => c.pre_execute(env),
            CommandKind::Create(c) => c.pre_execute(env, ids),
            CommandKind::Update(c) => c.pre_execute(env, ids),
            CommandKind::ResolveReferences(_) | CommandKind::CheckReferences(_) => Ok(()),
            CommandKind::Read(c) => c.pre_execute(env),
        }
    }

    pub fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        match &mut self.kind {
            CommandKind::Delete(c) => c.execute(env, conn),
            CommandKind::Create(c) => c.execute(env, state, conn),
            CommandKind::Update(c) => c.execute(env, state, conn),
            CommandKind::ResolveReferences(c) => c.execute(env, state, conn),
            CommandKind::CheckReferences(c) => c.execute(env, state, conn),
            CommandKind::Read(c) => c.execute(env, state, conn),
        }
    }

    /// Builds the response entry, if this command owns one, and emits events.
    pub fn post_execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        conn: &Connection,
        events: &mut dyn EventSink,
    ) -> Result<Option<ResponseEntry>, EngineError> {
        match &mut self.kind {
            CommandKind::Delete(c) => c.post_execute(env, events).map(Some),
            CommandKind::Create(c) => c.post_execute(env, conn, events).map(Some),
            CommandKind::Update(c) => c.post_execute(env, conn, events).map(Some),
            CommandKind::ResolveReferences(_) | CommandKind::CheckReferences(_) => Ok(None),
            CommandKind::Read(c) => c.post_execute(env).map(Some),
        }
    }
}

/// Renders query parameters back into `k=v&k=v` form for diagnostics.
pub(crate) fn query_string(params: &QueryParams) -> String {
    params
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |v| format!("{key}={v}")))
        .collect::<Vec<_>>()
        .join("&")
}

/// Re-reads the version a command wrote, so responses and events reflect
/// in-place reference rewrites but not later entries touching the same id.
pub(crate) fn reload(env: &ExecutionEnv<'_>, conn: &Connection, row: &Persisted) -> Result<Resource, EngineError> {
    env.typed(&row.key.resource_type)?
        .read_version(conn, &row.key.id, row.version)?
        .ok_or_else(|| EngineError::NotFound {
            resource_type: row.key.resource_type.clone(),
            id: row.key.id.clone(),
        })
}
