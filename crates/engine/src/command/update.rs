use rusqlite::Connection;
use tracing::debug;
use versa_core::resource::parse_etag;
use versa_core::{QueryParams, RequestUrl, Resource, ResourceId, ResponseEntry, Status};
use versa_storage::VersionedStore;

use super::{ExecutionEnv, ExecutionState, Persisted, query_string, reload};
use crate::access::{Access, require};
use crate::error::EngineError;
use crate::events::{Event, EventSink};
use crate::id_table::{IdTranslationTable, ResourceKey};
use crate::response::success_entry;

#[derive(Debug)]
enum Target {
    Id(String),
    Condition(QueryParams),
}

#[derive(Debug)]
enum UpdateOutcome {
    Updated(Persisted),
    /// A conditional update that matched nothing and created instead.
    Created(Persisted),
}

#[derive(Debug)]
pub struct UpdateCommand {
    index: usize,
    url: RequestUrl,
    full_url: Option<String>,
    resource: Resource,
    if_match: Option<String>,
    target: Option<Target>,
    expected_version: Option<u64>,
    outcome: Option<UpdateOutcome>,
}

impl UpdateCommand {
    pub fn new(
        index: usize,
        url: RequestUrl,
        full_url: Option<String>,
        resource: Resource,
        if_match: Option<String>,
    ) -> Self {
        Self {
            index,
            url,
            full_url,
            resource,
            if_match,
            target: None,
            expected_version: None,
            outcome: None,
        }
    }

    pub(super) fn pre_execute(&mut self, env: &ExecutionEnv<'_>, ids: &mut IdTranslationTable) -> Result<(), EngineError> {
        let resource_type = self.resource.resource_type.clone();
        let url_type = self.url.first_segment().unwrap_or_default();
        if url_type != resource_type {
            return Err(EngineError::bad_request(format!(
                "entry {}: url type '{url_type}' does not match resource type '{resource_type}'",
                self.index
            )));
        }
        env.typed(&resource_type)?;

        self.expected_version = match &self.if_match {
            Some(etag) => Some(parse_etag(etag).ok_or_else(|| {
                EngineError::bad_request(format!("entry {}: malformed ifMatch '{etag}'", self.index))
            })?),
            None => None,
        };

        match (self.url.segments(), self.url.query()) {
            ([_, id], None) => {
                let id = id.clone();
                self.check_by_id(env, &id)?;
                self.target = Some(Target::Id(id));
                Ok(())
            }
            ([_], Some(query)) if !query.is_empty() => {
                self.target = Some(Target::Condition(query.clone()));
                if let Some(id) = self.resource.id.as_deref().filter(|id| env.is_temporary(id)) {
                    if self.full_url.as_deref() != Some(id) {
                        return Err(EngineError::bad_request(format!(
                            "entry {}: temporary id '{id}' does not match fullUrl",
                            self.index
                        )));
                    }
                }
                match self.full_url.as_deref() {
                    Some(full_url) if env.is_temporary(full_url) => {
                        ids.register_pending(full_url, &resource_type)
                    }
                    _ => Ok(()),
                }
            }
            _ => Err(EngineError::bad_request(format!(
                "entry {}: update url must be '{resource_type}/{{id}}' or '{resource_type}?{{query}}', got '{}'",
                self.index, self.url
            ))),
        }
    }

    fn check_by_id(&self, env: &ExecutionEnv<'_>, id: &str) -> Result<(), EngineError> {
        if self.resource.id.as_deref() != Some(id) {
            return Err(EngineError::bad_request(format!(
                "entry {}: resource id {:?} does not match url id '{id}'",
                self.index, self.resource.id
            )));
        }
        if let Some(full_url) = &self.full_url {
            let expected = env.full_url(&ResourceKey::new(&self.resource.resource_type, id));
            if env.is_temporary(full_url) || *full_url != expected {
                return Err(EngineError::bad_request(format!(
                    "entry {}: fullUrl '{full_url}' does not match '{expected}'",
                    self.index
                )));
            }
        }
        Ok(())
    }

    pub(super) fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        let outcome = match &self.target {
            Some(Target::Id(id)) => self.update_by_id(env, conn, id)?,
            Some(Target::Condition(condition)) => self.update_by_condition(env, state, conn, condition)?,
            None => {
                return Err(EngineError::Internal(format!(
                    "entry {}: update executed before pre-execute",
                    self.index
                )));
            }
        };
        let row = match &outcome {
            UpdateOutcome::Updated(row) | UpdateOutcome::Created(row) => row.clone(),
        };
        state.record_persisted(self.index, row);
        self.outcome = Some(outcome);
        Ok(())
    }

    fn update_by_id(&self, env: &ExecutionEnv<'_>, conn: &Connection, id: &str) -> Result<UpdateOutcome, EngineError> {
        let resource_type = &self.resource.resource_type;
        let store = env.typed(resource_type)?;
        let current = store
            .read_including_deleted(conn, id)?
            .ok_or_else(|| EngineError::UpdateAsCreateNotAllowed {
                resource_type: resource_type.clone(),
                id: id.to_string(),
            })?;
        self.store_update(env, conn, &current.resource, id)
    }

    fn update_by_condition(
        &self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
        condition: &QueryParams,
    ) -> Result<UpdateOutcome, EngineError> {
        let resource_type = self.resource.resource_type.clone();
        // An id that is only a placeholder counts as no id.
        let supplied_id = self
            .resource
            .id
            .as_deref()
            .filter(|id| !env.is_temporary(id));
        let pending = self
            .full_url
            .as_deref()
            .filter(|full_url| env.is_temporary(full_url));

        let page = env.search_by_condition(conn, &resource_type, condition, 2)?;
        match page.total {
            0 => {
                if let Some(id) = supplied_id {
                    return Err(EngineError::UpdateAsCreateNotAllowed {
                        resource_type,
                        id: id.to_string(),
                    });
                }
                let key = match pending {
                    Some(full_url) => state.ids.bind_fresh(full_url)?,
                    None => ResourceKey::new(&resource_type, &ResourceId::new().to_string()),
                };
                let mut resource = self.resource.clone();
                resource.clear_stamp();
                require(
                    env.access.reason_create_allowed(env.user, &resource),
                    Access::Create,
                    env.user,
                    &resource,
                )?;
                let stored = env.typed(&resource_type)?.create(conn, resource, &key.id)?;
                debug!(
                    target: "versa::command",
                    index = self.index,
                    key = %key,
                    "conditional update matched nothing, created"
                );
                Ok(UpdateOutcome::Created(Persisted::of(&stored)?))
            }
            1 => {
                let current = page.resources.into_iter().next().ok_or_else(|| {
                    EngineError::Internal("search total and page disagree".into())
                })?;
                let matched_id = current.id.clone().unwrap_or_default();
                if let Some(id) = supplied_id {
                    if id != matched_id {
                        return Err(EngineError::bad_request(format!(
                            "entry {}: resource id '{id}' does not match the resource found by the condition ({resource_type}/{matched_id})",
                            self.index
                        )));
                    }
                }
                if let Some(full_url) = pending {
                    state.ids.bind(full_url, &matched_id)?;
                }
                self.store_update(env, conn, &current, &matched_id)
            }
            count => Err(EngineError::MultipleMatches {
                resource_type,
                query: query_string(condition),
                count,
            }),
        }
    }

    fn store_update(
        &self,
        env: &ExecutionEnv<'_>,
        conn: &Connection,
        current: &Resource,
        id: &str,
    ) -> Result<UpdateOutcome, EngineError> {
        let mut resource = self.resource.clone();
        resource.clear_stamp();
        resource.id = Some(id.to_string());
        require(
            env.access.reason_update_allowed(env.user, current, &resource),
            Access::Update,
            env.user,
            &resource,
        )?;
        let stored = env
            .typed(&resource.resource_type)?
            .update(conn, resource, self.expected_version)?;
        Ok(UpdateOutcome::Updated(Persisted::of(&stored)?))
    }

    pub(super) fn post_execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        conn: &Connection,
        events: &mut dyn EventSink,
    ) -> Result<ResponseEntry, EngineError> {
        match &self.outcome {
            Some(UpdateOutcome::Updated(row)) => {
                let stored = reload(env, conn, row)?;
                events.emit(Event::updated(&stored));
                Ok(success_entry(env, self.index, Status::OK, &stored, "updated"))
            }
            Some(UpdateOutcome::Created(row)) => {
                let stored = reload(env, conn, row)?;
                events.emit(Event::created(&stored));
                Ok(success_entry(env, self.index, Status::CREATED, &stored, "created"))
            }
            None => Err(EngineError::Internal(format!(
                "entry {}: update was not executed",
                self.index
            ))),
        }
    }
}
