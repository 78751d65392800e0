use rusqlite::Connection;
use versa_storage::VersionedStore;

use super::{ExecutionEnv, ExecutionState, reload};
use crate::error::EngineError;
use crate::resolver::ReferenceResolver;

/// Rewrites the references of the version written by the Create or Update
/// at the same index, without adding a new version.
#[derive(Debug)]
pub struct ResolveReferencesCommand {
    index: usize,
}

impl ResolveReferencesCommand {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub(super) fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        // Nothing was written, e.g. a conditional create that matched.
        let Some(row) = state.persisted(self.index).cloned() else {
            return Ok(());
        };
        let mut resource = reload(env, conn, &row)?;
        let resolver = ReferenceResolver::new(env, conn, self.index);
        if resolver.resolve(&state.ids, &mut resource)? {
            env.typed(&row.key.resource_type)?.update_in_place(conn, &resource)?;
        }
        Ok(())
    }
}

/// Verifies, without mutating, that the row written at the same index only
/// holds resolvable references.
#[derive(Debug)]
pub struct CheckReferencesCommand {
    index: usize,
}

impl CheckReferencesCommand {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub(super) fn execute(
        &mut self,
        env: &ExecutionEnv<'_>,
        state: &mut ExecutionState,
        conn: &Connection,
    ) -> Result<(), EngineError> {
        let Some(row) = state.persisted(self.index) else {
            return Ok(());
        };
        let resource = reload(env, conn, row)?;
        ReferenceResolver::new(env, conn, self.index).check(&resource)
    }
}
