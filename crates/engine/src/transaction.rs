use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use tracing::{debug, info, warn};
use versa_core::{BundleId, BundleResponse, BundleType};
use versa_storage::{StorageError, is_read_only, set_read_only};

use crate::command::{Command, ExecutionEnv, ExecutionState};
use crate::error::EngineError;
use crate::events::{EventHandler, TransactionEvents};
use crate::factory::CommandList;
use crate::response::{assemble, failed_transaction};

/// A phase failure together with the entry it belongs to.
struct Failure {
    index: Option<usize>,
    error: EngineError,
}

impl Failure {
    fn at(index: usize) -> impl FnOnce(EngineError) -> Failure {
        move |error| Failure {
            index: Some(index),
            error,
        }
    }
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Self { index: None, error }
    }
}

/// Runs every command of `list` in one database transaction. Either all
/// entries succeed and their events are delivered after commit, or nothing
/// is persisted and no event is delivered.
pub(crate) fn run_transaction(
    bundle_id: BundleId,
    env: &ExecutionEnv<'_>,
    conn: &Connection,
    list: CommandList,
    handler: &dyn EventHandler,
) -> Result<BundleResponse, EngineError> {
    let entry_count = list.entry_count;
    let read_only = list.is_read_only();
    let mut commands = list.commands;
    // Stable, so equal priorities keep entry order.
    commands.sort_by_key(|c| (c.priority(), c.index()));

    with_read_only(conn, read_only, || {
        exec(conn, if read_only { "BEGIN DEFERRED" } else { "BEGIN IMMEDIATE" })?;

        let mut attempted = BTreeSet::new();
        let mut events = TransactionEvents::new();
        let result = run_phases(env, conn, &mut commands, &mut attempted, &mut events);

        let result = result.and_then(|entries| {
            exec(conn, "COMMIT")?;
            Ok(entries)
        });

        match result {
            Ok(entries) => {
                info!(
                    target: "versa::txn",
                    bundle = %bundle_id,
                    entries = entry_count,
                    events = events.len(),
                    "transaction committed"
                );
                events.release(handler);
                Ok(assemble(BundleType::TransactionResponse, entry_count, entries))
            }
            Err(failure) => {
                if !conn.is_autocommit() {
                    let _ = exec(conn, "ROLLBACK");
                }
                warn!(
                    target: "versa::txn",
                    bundle = %bundle_id,
                    index = ?failure.index,
                    error = %failure.error,
                    "transaction rolled back"
                );
                Ok(failed_transaction(entry_count, failure.index, &failure.error, &attempted))
            }
        }
    })
}

fn run_phases(
    env: &ExecutionEnv<'_>,
    conn: &Connection,
    commands: &mut [Command],
    attempted: &mut BTreeSet<usize>,
    events: &mut TransactionEvents,
) -> Result<BTreeMap<usize, versa_core::ResponseEntry>, Failure> {
    let mut state = ExecutionState::new();

    for command in commands.iter_mut() {
        command.pre_execute(env, &mut state.ids).map_err(Failure::at(command.index()))?;
    }

    for command in commands.iter_mut() {
        attempted.insert(command.index());
        debug!(target: "versa::txn", index = command.index(), command = command.name(), "execute");
        command.execute(env, &mut state, conn).map_err(Failure::at(command.index()))?;
    }

    let mut entries = BTreeMap::new();
    for command in commands.iter_mut() {
        let index = command.index();
        if let Some(entry) = command.post_execute(env, conn, events).map_err(Failure::at(index))? {
            entries.insert(index, entry);
        }
    }
    Ok(entries)
}

/// Runs `f` with `PRAGMA query_only` set to `read_only`, restoring the
/// previous setting afterwards.
pub(crate) fn with_read_only<T>(
    conn: &Connection,
    read_only: bool,
    f: impl FnOnce() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let previous = is_read_only(conn)?;
    if previous != read_only {
        set_read_only(conn, read_only)?;
    }
    let result = f();
    if previous == read_only {
        return result;
    }
    keep_primary(result, set_read_only(conn, previous))
}

/// A failed pragma restore is logged; the bundle outcome, possibly already
/// committed, is what the caller sees.
fn keep_primary<T>(result: Result<T, EngineError>, restored: Result<(), StorageError>) -> Result<T, EngineError> {
    if let Err(error) = restored {
        warn!(target: "versa::txn", error = %error, "could not restore query_only");
    }
    result
}

pub(crate) fn exec(conn: &Connection, sql: &str) -> Result<(), EngineError> {
    conn.execute_batch(sql)
        .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
}
