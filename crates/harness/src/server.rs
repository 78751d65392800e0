use std::sync::Arc;

use versa_core::{Bundle, BundleEntry, BundleResponse, Resource, ReturnPreference, TypeRegistry};
use versa_engine::{AccessRules, Engine, EngineConfig, EngineError, User};
use versa_storage::{CompiledQuery, SqliteStorage, VersionRow, VersionedStore};

use crate::builders::{create_entry, temp_url, transaction};
use crate::fixtures::RecordingEvents;

/// An engine over an in-memory store with recorded events.
pub struct TestServer {
    pub engine: Engine,
    pub events: Arc<RecordingEvents>,
    pub user: User,
}

impl TestServer {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        let engine = Engine::new(config, TypeRegistry::standard())?;
        Ok(Self::from_engine(engine))
    }

    /// Wraps an engine over an already opened database.
    pub fn with_storage(config: EngineConfig, storage: SqliteStorage) -> Self {
        let engine = Engine::with_storage(config, Arc::new(TypeRegistry::standard()), storage);
        Self::from_engine(engine)
    }

    fn from_engine(engine: Engine) -> Self {
        let events = Arc::new(RecordingEvents::new());
        Self {
            engine: engine.with_event_handler(events.clone()),
            events,
            user: User::new("test-user"),
        }
    }

    pub fn with_access(mut self, access: impl AccessRules + 'static) -> Self {
        self.engine = self.engine.with_access_rules(Arc::new(access));
        self
    }

    /// Executes with the default `Representation` preference.
    pub fn execute(&mut self, bundle: &Bundle) -> Result<BundleResponse, EngineError> {
        self.engine
            .execute(bundle, &self.user, ReturnPreference::Representation)
    }

    pub fn transaction(&mut self, entries: Vec<BundleEntry>) -> Result<BundleResponse, EngineError> {
        self.execute(&transaction(entries))
    }

    /// Creates `resource` in its own transaction and returns the new id.
    pub fn create(&mut self, resource: Resource) -> Result<String, Box<dyn std::error::Error>> {
        let response = self.transaction(vec![create_entry(&temp_url(), resource)])?;
        let entry = response.entry(0).ok_or("missing response entry")?;
        if !entry.is_success() {
            return Err(format!("create failed: {:?}", entry.outcome).into());
        }
        let created = entry.resource.as_ref().ok_or("missing created resource")?;
        Ok(created.id.clone().ok_or("created resource has no id")?)
    }

    /// The current row, straight from the store.
    pub fn read(&self, resource_type: &str, id: &str) -> Result<Option<Resource>, Box<dyn std::error::Error>> {
        let store = self.engine.store().for_type(resource_type)?;
        Ok(store.read(self.engine.storage().conn(), id)?)
    }

    pub fn history(&self, resource_type: &str, id: &str) -> Result<Vec<VersionRow>, Box<dyn std::error::Error>> {
        let store = self.engine.store().for_type(resource_type)?;
        Ok(store.history(self.engine.storage().conn(), id)?)
    }

    /// Number of live resources of `resource_type`.
    pub fn count(&self, resource_type: &str) -> Result<usize, Box<dyn std::error::Error>> {
        let store = self.engine.store().for_type(resource_type)?;
        Ok(store.count(self.engine.storage().conn(), &CompiledQuery::new(resource_type))?)
    }
}
