use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::{info, warn};
use versa_core::{BundleId, BundleResponse, BundleType};

use crate::command::{Command, ExecutionEnv, ExecutionState};
use crate::error::EngineError;
use crate::events::{DirectEvents, EventHandler};
use crate::factory::CommandList;
use crate::response::{assemble, error_entry};
use crate::transaction::{exec, with_read_only};

/// Runs every entry of `list` independently. A failure is recorded against
/// its own index and skips the later phases of that index only. Each index
/// that writes commits in its own transaction.
pub(crate) fn run_batch(
    bundle_id: BundleId,
    env: &ExecutionEnv<'_>,
    conn: &Connection,
    list: CommandList,
    handler: &dyn EventHandler,
) -> Result<BundleResponse, EngineError> {
    let entry_count = list.entry_count;
    let read_only = list.is_read_only();
    let mut commands = list.commands;

    with_read_only(conn, read_only, || {
        let mut state = ExecutionState::new();
        let mut failures: BTreeMap<usize, EngineError> = BTreeMap::new();

        for command in commands.iter_mut() {
            let index = command.index();
            if failures.contains_key(&index) {
                continue;
            }
            if let Err(error) = command.pre_execute(env, &mut state.ids) {
                record_failure(bundle_id, &mut failures, index, "pre-execute", error);
            }
        }

        // The factory emits the commands of one entry next to each other.
        for group in commands.chunk_by_mut(|a, b| a.index() == b.index()) {
            let Some(index) = group.first().map(Command::index) else {
                continue;
            };
            if failures.contains_key(&index) {
                info!(target: "versa::batch", bundle = %bundle_id, index, "skipping later phases of failed entry");
                continue;
            }
            if let Err(error) = execute_entry(env, &mut state, conn, group, read_only) {
                state.forget(index);
                record_failure(bundle_id, &mut failures, index, "execute", error);
            }
        }

        let mut entries = BTreeMap::new();
        let mut events = DirectEvents::new(handler);
        for group in commands.chunk_by_mut(|a, b| a.index() == b.index()) {
            let Some(index) = group.first().map(Command::index) else {
                continue;
            };
            if failures.contains_key(&index) {
                continue;
            }
            for command in group.iter_mut() {
                match command.post_execute(env, conn, &mut events) {
                    Ok(Some(entry)) => {
                        entries.insert(index, entry);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        record_failure(bundle_id, &mut failures, index, "post-execute", error);
                        break;
                    }
                }
            }
        }

        for (index, error) in &failures {
            entries.insert(*index, error_entry(*index, error));
        }
        info!(
            target: "versa::batch",
            bundle = %bundle_id,
            entries = entry_count,
            failed = failures.len(),
            "batch finished"
        );
        Ok(assemble(BundleType::BatchResponse, entry_count, entries))
    })
}

/// Executes the commands of one entry, inside their own transaction unless
/// the whole batch is read-only.
fn execute_entry(
    env: &ExecutionEnv<'_>,
    state: &mut ExecutionState,
    conn: &Connection,
    group: &mut [Command],
    read_only: bool,
) -> Result<(), EngineError> {
    if read_only {
        for command in group.iter_mut() {
            command.execute(env, state, conn)?;
        }
        return Ok(());
    }

    exec(conn, "BEGIN IMMEDIATE")?;
    let result = group
        .iter_mut()
        .try_for_each(|command| command.execute(env, state, conn));

    match result.and_then(|()| exec(conn, "COMMIT")) {
        Ok(()) => Ok(()),
        Err(e) => {
            if !conn.is_autocommit() {
                let _ = exec(conn, "ROLLBACK");
            }
            Err(e)
        }
    }
}

fn record_failure(
    bundle_id: BundleId,
    failures: &mut BTreeMap<usize, EngineError>,
    index: usize,
    phase: &str,
    error: EngineError,
) {
    warn!(
        target: "versa::batch",
        bundle = %bundle_id,
        index,
        phase,
        error = %error,
        "entry failed"
    );
    failures.insert(index, error);
}
