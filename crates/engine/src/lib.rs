pub mod access;
mod batch;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod id_table;
pub mod resolver;
mod response;
mod transaction;

pub use access::{AccessRules, AllowAll, User};
pub use config::{EngineConfig, StorageConfig};
pub use error::{EngineError, ErrorKind};
pub use events::{Event, EventError, EventHandler, EventKind, NoopEventHandler};
pub use factory::{CommandFactory, CommandList, ExecutionMode};
pub use id_table::{IdTranslationTable, ResourceKey};

use std::sync::Arc;

use tracing::info;
use versa_core::{Bundle, BundleId, BundleResponse, ReturnPreference, TypeRegistry};
use versa_storage::{JsonPathQueryCompiler, QueryCompiler, ResourceStore, SqliteStorage};

use crate::command::ExecutionEnv;

/// Executes batch and transaction bundles against one SQLite database.
pub struct Engine {
    config: EngineConfig,
    store: ResourceStore,
    storage: SqliteStorage,
    compiler: Box<dyn QueryCompiler>,
    access: Arc<dyn AccessRules>,
    events: Arc<dyn EventHandler>,
}

impl Engine {
    /// Validates `config` and opens the database it names.
    pub fn new(config: EngineConfig, registry: TypeRegistry) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Arc::new(registry);
        let storage = if config.storage.is_in_memory() {
            SqliteStorage::open_in_memory(&registry)?
        } else {
            SqliteStorage::open_with_timeout(&config.storage.path, &registry, config.storage.busy_timeout())?
        };
        Ok(Self::with_storage(config, registry, storage))
    }

    /// Uses an already opened database. Its schema must cover `registry`.
    pub fn with_storage(config: EngineConfig, registry: Arc<TypeRegistry>, storage: SqliteStorage) -> Self {
        let compiler = JsonPathQueryCompiler::new(config.default_page_count);
        Self {
            config,
            store: ResourceStore::new(registry),
            storage,
            compiler: Box::new(compiler),
            access: Arc::new(AllowAll),
            events: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_access_rules(mut self, access: Arc<dyn AccessRules>) -> Self {
        self.access = access;
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_query_compiler(mut self, compiler: Box<dyn QueryCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    /// Executes `bundle` for `user`.
    ///
    /// Malformed bundles are rejected with `Err` before anything runs. Once
    /// execution starts, entry and transaction failures are reported inside
    /// the returned response.
    pub fn execute(
        &mut self,
        bundle: &Bundle,
        user: &User,
        preference: ReturnPreference,
    ) -> Result<BundleResponse, EngineError> {
        let bundle_id = BundleId::new();
        let list = CommandFactory::new(&self.config).build(bundle)?;
        info!(
            target: "versa::engine",
            bundle = %bundle_id,
            mode = ?list.mode,
            entries = list.entry_count,
            user = %user.name,
            "executing bundle"
        );

        let env = ExecutionEnv {
            config: &self.config,
            store: &self.store,
            compiler: self.compiler.as_ref(),
            access: self.access.as_ref(),
            user,
            preference,
        };
        let conn = self.storage.conn();
        let handler = self.events.as_ref();
        match list.mode {
            ExecutionMode::Batch => batch::run_batch(bundle_id, &env, conn, list, handler),
            ExecutionMode::Transaction => transaction::run_transaction(bundle_id, &env, conn, list, handler),
        }
    }
}
