use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use versa_core::resource::parse_etag;
use versa_core::{QueryParams, RequestUrl, Resource, ResponseEntry, Status};
use versa_storage::VersionedStore;
use versa_storage::query::strip_standard_parameters;

use super::{ExecutionEnv, ExecutionState, query_string};
use crate::access::{Access, require};
use crate::error::EngineError;
use crate::id_table::ResourceKey;
use crate::response::success_entry;

#[derive(Debug)]
enum Target {
    /// A bundle-local placeholder, translated at execute.
    Temporary(String),
    Id(ResourceKey),
    Version(ResourceKey, u64),
    Search { resource_type: String, query: QueryParams },
}

#[derive(Debug)]
enum ReadOutcome {
    Found(Resource),
    NotModified(Resource),
}

#[derive(Debug)]
pub struct ReadCommand {
    index: usize,
    url: RequestUrl,
    if_none_match: Option<String>,
    if_modified_since: Option<DateTime<Utc>>,
    target: Option<Target>,
    outcome: Option<ReadOutcome>,
}

impl ReadCommand {
    pub fn new(
        index: usize,
        url: RequestUrl,
        if_none_match: Option<String>,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            index,
            url,
            if_none_match,
            if_modified_since,
            target: None,
            outcome: None,
        }
    }

    pub(super) fn pre_execute(&mut self, env: &ExecutionEnv<'_>) -> Result<(), EngineError> {
        let not_found = |resource_type: &str, id: &str| EngineError::NotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        };
        let target = match (self.url.segments(), self.url.query()) {
            ([reference], None) if env.is_temporary(reference) => Target::Temporary(reference.clone()),
            ([resource_type, id], None) => Target::Id(ResourceKey::new(resource_type, id)),
            ([resource_type, id, history, version], None) if history == "_history" => {
                let version = version.parse::<u64>().map_err(|_| not_found(resource_type, id))?;
                Target::Version(ResourceKey::new(resource_type, id), version)
            }
            ([resource_type], Some(query)) if !query.is_empty() => Target::Search {
                resource_type: resource_type.clone(),
                query: query.clone(),
            },
            _ => {
                return Err(EngineError::bad_request(format!(
                    "entry {}: unsupported read url '{}'",
                    self.index, self.url
                )));
            }
        };

        let unknown_type = match &target {
            Target::Temporary(_) => None,
            Target::Id(key) | Target::Version(key, _) => Some((key.resource_type.clone(), key.id.clone())),
            Target::Search { resource_type, .. } => Some((resource_type.clone(), String::new())),
        }
        .filter(|(resource_type, _)| !env.store.registry().contains(resource_type));
        if let Some((resource_type, id)) = unknown_type {
            return Err(not_found(&resource_type, &id));
        }
        self.target = Some(target);
        Ok(())
    }

    pub(super) fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        let resource = match &self.target {
            Some(Target::Temporary(reference)) => {
                let key = state.ids.lookup(reference).ok_or_else(|| {
                    EngineError::bad_request(format!(
                        "entry {}: {reference} does not name a resource in this bundle",
                        self.index
                    ))
                })?;
                read_current(env, conn, key)?
            }
            Some(Target::Id(key)) => read_current(env, conn, key)?,
            Some(Target::Version(key, version)) => env
                .typed(&key.resource_type)?
                .read_version(conn, &key.id, *version)?
                .ok_or_else(|| EngineError::NotFound {
                    resource_type: key.resource_type.clone(),
                    id: format!("{}/_history/{version}", key.id),
                })?,
            Some(Target::Search { resource_type, query }) => search_one(env, conn, resource_type, query)?,
            None => {
                return Err(EngineError::Internal(format!(
                    "entry {}: read executed before pre-execute",
                    self.index
                )));
            }
        };

        require(
            env.access.reason_read_allowed(env.user, &resource),
            Access::Read,
            env.user,
            &resource,
        )?;

        self.outcome = Some(if self.not_modified(&resource) {
            ReadOutcome::NotModified(resource)
        } else {
            ReadOutcome::Found(resource)
        });
        Ok(())
    }

    fn not_modified(&self, resource: &Resource) -> bool {
        let etag_matches = match (&self.if_none_match, resource.version()) {
            (Some(etag), Some(version)) => parse_etag(etag) == Some(version),
            _ => false,
        };
        // Last-Modified has second precision on the wire.
        let unmodified = match (self.if_modified_since, resource.last_modified()) {
            (Some(since), Some(modified)) => since.timestamp() >= modified.timestamp(),
            _ => false,
        };
        etag_matches || unmodified
    }

    pub(super) fn post_execute(&mut self, env: &ExecutionEnv<'_>) -> Result<ResponseEntry, EngineError> {
        match &self.outcome {
            Some(ReadOutcome::Found(resource)) => Ok(success_entry(env, self.index, Status::OK, resource, "read")),
            Some(ReadOutcome::NotModified(resource)) => {
                let mut entry = ResponseEntry::new(self.index, Status::NOT_MODIFIED);
                entry.location = Some(env.location(resource));
                entry.etag = resource.etag();
                entry.last_modified = resource.last_modified();
                Ok(entry)
            }
            None => Err(EngineError::Internal(format!(
                "entry {}: read was not executed",
                self.index
            ))),
        }
    }
}

fn read_current(env: &ExecutionEnv<'_>, conn: &Connection, key: &ResourceKey) -> Result<Resource, EngineError> {
    env.typed(&key.resource_type)?
        .read(conn, &key.id)?
        .ok_or_else(|| EngineError::NotFound {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
        })
}

/// A conditional read must match exactly one resource. Unsupported
/// parameters fail the read, or are dropped when search handling is lenient.
fn search_one(
    env: &ExecutionEnv<'_>,
    conn: &Connection,
    resource_type: &str,
    query: &QueryParams,
) -> Result<Resource, EngineError> {
    let store = env.typed(resource_type)?;
    let (mut filter, _) = strip_standard_parameters(query);

    let mut compiled = env.compiler.compile(store.descriptor(), &filter);
    if compiled.has_errors() {
        if env.config.strict_search_handling {
            return Err(EngineError::InvalidQuery {
                resource_type: resource_type.to_string(),
                errors: compiled.errors.iter().map(ToString::to_string).collect(),
            });
        }
        warn!(
            target: "versa::command",
            resource_type,
            errors = ?compiled.errors,
            "ignoring unsupported search parameters"
        );
        for error in &compiled.errors {
            filter.remove(&error.parameter);
        }
        compiled = env.compiler.compile(store.descriptor(), &filter);
    }
    compiled.page = 1;
    compiled.count = 2;

    let page = store.search(conn, &compiled)?;
    match page.total {
        0 => Err(EngineError::NotFound {
            resource_type: resource_type.to_string(),
            id: format!("?{}", query_string(query)),
        }),
        1 => page
            .resources
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Internal("search total and page disagree".into())),
        count => Err(EngineError::MultipleMatches {
            resource_type: resource_type.to_string(),
            query: query_string(query),
            count,
        }),
    }
}
