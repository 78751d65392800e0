use rusqlite::Connection;
use tracing::debug;
use versa_core::url::parse_query;
use versa_core::{QueryParams, RequestUrl, Resource, ResponseEntry, Status};
use versa_storage::VersionedStore;

use super::{ExecutionEnv, ExecutionState, Persisted, query_string, reload};
use crate::access::{Access, require};
use crate::error::EngineError;
use crate::events::{Event, EventSink};
use crate::id_table::IdTranslationTable;
use crate::response::success_entry;

#[derive(Debug)]
enum CreateOutcome {
    Created(Persisted),
    /// The if-none-exist condition matched; nothing was inserted.
    Exists(Resource),
}

#[derive(Debug)]
pub struct CreateCommand {
    index: usize,
    url: RequestUrl,
    full_url: Option<String>,
    resource: Resource,
    if_none_exist: Option<String>,
    condition: Option<QueryParams>,
    outcome: Option<CreateOutcome>,
}

impl CreateCommand {
    pub fn new(
        index: usize,
        url: RequestUrl,
        full_url: Option<String>,
        resource: Resource,
        if_none_exist: Option<String>,
    ) -> Self {
        Self {
            index,
            url,
            full_url,
            resource,
            if_none_exist,
            condition: None,
            outcome: None,
        }
    }

    pub(super) fn pre_execute(&mut self, env: &ExecutionEnv<'_>, ids: &mut IdTranslationTable) -> Result<(), EngineError> {
        let resource_type = self.resource.resource_type.clone();
        if self.url.has_query() || self.url.segments() != [resource_type.as_str()] {
            return Err(EngineError::bad_request(format!(
                "entry {}: create url must be '{resource_type}', got '{}'",
                self.index, self.url
            )));
        }

        let full_url = match &self.full_url {
            Some(full_url) if env.is_temporary(full_url) => full_url.clone(),
            other => {
                return Err(EngineError::bad_request(format!(
                    "entry {}: create needs a fullUrl starting with '{}', got {other:?}",
                    self.index, env.config.temporary_prefix
                )));
            }
        };
        match &self.resource.id {
            Some(id) if *id != full_url => {
                return Err(EngineError::bad_request(format!(
                    "entry {}: resource id '{id}' does not match fullUrl '{full_url}'",
                    self.index
                )));
            }
            _ => {}
        }

        match &self.if_none_exist {
            Some(condition) => {
                self.condition = Some(parse_condition(self.index, condition)?);
                ids.register_pending(&full_url, &resource_type)
            }
            None => ids.reserve(&full_url, &resource_type).map(|_| ()),
        }
    }

    pub(super) fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        require(
            env.access.reason_create_allowed(env.user, &self.resource),
            Access::Create,
            env.user,
            &self.resource,
        )?;

        let resource_type = self.resource.resource_type.clone();
        let full_url = self.full_url.clone().unwrap_or_default();

        let key = match &self.condition {
            None => state.ids.lookup(&full_url).cloned().ok_or_else(|| {
                EngineError::Internal(format!("{full_url} has no reserved id"))
            })?,
            Some(condition) => {
                let page = env.search_by_condition(conn, &resource_type, condition, 2)?;
                match page.total {
                    0 => state.ids.bind_fresh(&full_url)?,
                    1 => {
                        let existing = page.resources.into_iter().next().ok_or_else(|| {
                            EngineError::Internal("search total and page disagree".into())
                        })?;
                        let id = existing.id.clone().unwrap_or_default();
                        state.ids.bind(&full_url, &id)?;
                        debug!(
                            target: "versa::command",
                            index = self.index,
                            resource_type = %resource_type,
                            id = %id,
                            "conditional create matched existing resource"
                        );
                        self.outcome = Some(CreateOutcome::Exists(existing));
                        return Ok(());
                    }
                    count => {
                        return Err(EngineError::MultipleMatches {
                            resource_type,
                            query: query_string(condition),
                            count,
                        });
                    }
                }
            }
        };

        let mut resource = self.resource.clone();
        resource.clear_stamp();
        let stored = env.typed(&resource_type)?.create(conn, resource, &key.id)?;
        let row = Persisted::of(&stored)?;
        state.record_persisted(self.index, row.clone());
        self.outcome = Some(CreateOutcome::Created(row));
        Ok(())
    }

    pub(super) fn post_execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        conn: &Connection,
        events: &mut dyn EventSink,
    ) -> Result<ResponseEntry, EngineError> {
        match &self.outcome {
            Some(CreateOutcome::Created(row)) => {
                let stored = reload(env, conn, row)?;
                events.emit(Event::created(&stored));
                Ok(success_entry(env, self.index, Status::CREATED, &stored, "created"))
            }
            Some(CreateOutcome::Exists(existing)) => Ok(success_entry(
                env,
                self.index,
                Status::OK,
                existing,
                "resource already exists",
            )),
            None => Err(EngineError::Internal(format!(
                "entry {}: create was not executed",
                self.index
            ))),
        }
    }
}

/// Accepts `k=v&...` with or without the leading `?`. A path part such as
/// `Patient?k=v` is rejected.
fn parse_condition(index: usize, condition: &str) -> Result<QueryParams, EngineError> {
    let trimmed = condition.trim();
    let query = match trimmed.split_once('?') {
        Some(("", query)) => query,
        Some((path, _)) => {
            return Err(EngineError::bad_request(format!(
                "entry {index}: ifNoneExist must not contain a path, got '{path}'"
            )));
        }
        None => trimmed,
    };
    let params = parse_query(query);
    if params.is_empty() {
        return Err(EngineError::bad_request(format!(
            "entry {index}: ifNoneExist has no search parameters"
        )));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_accepts_optional_question_mark() {
        let with = parse_condition(0, "?identifier=http://sys|1").unwrap();
        let without = parse_condition(0, "identifier=http://sys|1").unwrap();
        assert_eq!(with, without);
        assert_eq!(with["identifier"], vec!["http://sys|1".to_string()]);
    }

    #[test]
    fn condition_rejects_paths_and_empty_queries() {
        assert!(parse_condition(0, "Patient?identifier=x").is_err());
        assert!(parse_condition(0, "?").is_err());
        assert!(parse_condition(0, "").is_err());
    }
}
