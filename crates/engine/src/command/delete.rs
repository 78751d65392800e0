use rusqlite::Connection;
use versa_core::{Diagnostic, QueryParams, RequestUrl, ResponseEntry, Status};
use versa_storage::VersionedStore;

use super::{ExecutionEnv, query_string};
use crate::access::{Access, require};
use crate::error::EngineError;
use crate::events::{Event, EventSink};
use crate::id_table::ResourceKey;

#[derive(Debug)]
enum Target {
    Id(ResourceKey),
    Condition { resource_type: String, query: QueryParams },
}

#[derive(Debug)]
enum DeleteOutcome {
    /// `tombstoned` is false when the id was already deleted.
    Deleted { key: ResourceKey, tombstoned: bool },
    NoMatch,
}

#[derive(Debug)]
pub struct DeleteCommand {
    index: usize,
    url: RequestUrl,
    target: Option<Target>,
    outcome: Option<DeleteOutcome>,
}

impl DeleteCommand {
    pub fn new(index: usize, url: RequestUrl) -> Self {
        Self {
            index,
            url,
            target: None,
            outcome: None,
        }
    }

    pub(super) fn pre_execute(&mut self, env: &ExecutionEnv<'_>) -> Result<(), EngineError> {
        let target = match (self.url.segments(), self.url.query()) {
            ([resource_type, id], None) => Target::Id(ResourceKey::new(resource_type, id)),
            ([resource_type], Some(query)) if !query.is_empty() => Target::Condition {
                resource_type: resource_type.clone(),
                query: query.clone(),
            },
            _ => {
                return Err(EngineError::bad_request(format!(
                    "entry {}: delete url must be '{{type}}/{{id}}' or '{{type}}?{{query}}', got '{}'",
                    self.index, self.url
                )));
            }
        };
        let resource_type = match &target {
            Target::Id(key) => &key.resource_type,
            Target::Condition { resource_type, .. } => resource_type,
        };
        env.typed(resource_type)?;
        self.target = Some(target);
        Ok(())
    }

    pub(super) fn execute(&mut self, env: &ExecutionEnv<'_>, conn: &Connection) -> Result<(), EngineError> {
        let outcome = match &self.target {
            Some(Target::Id(key)) => delete_key(env, conn, key.clone())?,
            Some(Target::Condition { resource_type, query }) => {
                let page = env.search_by_condition(conn, resource_type, query, 2)?;
                match page.total {
                    0 => DeleteOutcome::NoMatch,
                    1 => {
                        let id = page
                            .resources
                            .first()
                            .and_then(|r| r.id.clone())
                            .ok_or_else(|| EngineError::Internal("search total and page disagree".into()))?;
                        delete_key(env, conn, ResourceKey::new(resource_type, &id))?
                    }
                    count => {
                        return Err(EngineError::MultipleMatches {
                            resource_type: resource_type.clone(),
                            query: query_string(query),
                            count,
                        });
                    }
                }
            }
            None => {
                return Err(EngineError::Internal(format!(
                    "entry {}: delete executed before pre-execute",
                    self.index
                )));
            }
        };
        self.outcome = Some(outcome);
        Ok(())
    }

    pub(super) fn post_execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        events: &mut dyn EventSink,
    ) -> Result<ResponseEntry, EngineError> {
        match &self.outcome {
            Some(DeleteOutcome::Deleted { key, tombstoned }) => {
                if *tombstoned {
                    events.emit(Event::deleted(&key.resource_type, &key.id));
                }
                let mut entry = ResponseEntry::new(self.index, Status::OK);
                entry.full_url = Some(env.full_url(key));
                let text = if *tombstoned {
                    format!("deleted {key}")
                } else {
                    format!("{key} was already deleted")
                };
                entry.outcome = Some(Diagnostic::information("informational", text));
                Ok(entry)
            }
            Some(DeleteOutcome::NoMatch) => Ok(ResponseEntry::new(self.index, Status::NO_CONTENT)),
            None => Err(EngineError::Internal(format!(
                "entry {}: delete was not executed",
                self.index
            ))),
        }
    }
}

fn delete_key(env: &ExecutionEnv<'_>, conn: &Connection, key: ResourceKey) -> Result<DeleteOutcome, EngineError> {
    let store = env.typed(&key.resource_type)?;
    let current = store
        .read_including_deleted(conn, &key.id)?
        .ok_or_else(|| EngineError::NotFound {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
        })?;
    require(
        env.access.reason_delete_allowed(env.user, &current.resource),
        Access::Delete,
        env.user,
        &current.resource,
    )?;
    let tombstoned = store.delete(conn, &key.id)?;
    Ok(DeleteOutcome::Deleted { key, tombstoned })
}
