use std::collections::{BTreeMap, BTreeSet};

use versa_core::{
    BundleResponse, BundleType, Diagnostic, ErrorOutcome, Resource, ResponseEntry, ReturnPreference,
    Status,
};

use crate::command::ExecutionEnv;
use crate::error::{EngineError, ErrorKind};

/// A success entry with location, etag and last-modified, carrying the
/// resource or an informational outcome as the caller prefers.
pub(crate) fn success_entry(
    env: &ExecutionEnv<'_>,
    index: usize,
    status: Status,
    resource: &Resource,
    message: &str,
) -> ResponseEntry {
    let mut entry = ResponseEntry::new(index, status);
    entry.full_url = resource
        .id
        .as_ref()
        .map(|id| format!("{}/{}/{id}", env.config.server_base, resource.resource_type));
    entry.location = Some(env.location(resource));
    entry.etag = resource.etag();
    entry.last_modified = resource.last_modified();
    match env.preference {
        ReturnPreference::Minimal => {}
        ReturnPreference::Representation => entry.resource = Some(resource.clone()),
        ReturnPreference::OperationOutcome => {
            entry.outcome = Some(Diagnostic::information("informational", message));
        }
    }
    entry
}

pub(crate) fn error_entry(index: usize, error: &EngineError) -> ResponseEntry {
    ResponseEntry::error(index, Status(error.status()), error.diagnostic())
}

/// Orders entries by index and fills any gap with a server error, so the
/// response always has exactly one entry per request entry.
pub(crate) fn assemble(
    bundle_type: BundleType,
    entry_count: usize,
    mut entries: BTreeMap<usize, ResponseEntry>,
) -> BundleResponse {
    let entries = (0..entry_count)
        .map(|index| {
            entries.remove(&index).unwrap_or_else(|| {
                ResponseEntry::error(
                    index,
                    Status::INTERNAL_SERVER_ERROR,
                    Diagnostic::error("exception", "no response produced for entry"),
                )
            })
        })
        .collect();
    BundleResponse {
        bundle_type,
        outcome: None,
        entries,
    }
}

/// Maps a transaction failure to the bundle-level outcome. Forbidden keeps
/// its status; other client errors become 400 with their own diagnostic;
/// anything else is a generic 500.
pub(crate) fn transaction_outcome(error: &EngineError) -> ErrorOutcome {
    match error.kind() {
        ErrorKind::Forbidden => ErrorOutcome {
            status: Status(403),
            diagnostic: error.diagnostic(),
        },
        _ if error.is_client_error() => ErrorOutcome {
            status: Status(400),
            diagnostic: error.diagnostic(),
        },
        _ => ErrorOutcome {
            status: Status::INTERNAL_SERVER_ERROR,
            diagnostic: Diagnostic::error("exception", "transaction failed, nothing was persisted"),
        },
    }
}

/// Response for a rolled back transaction: the failing entry carries the
/// error, the rest are marked rolled back or not attempted.
pub(crate) fn failed_transaction(
    entry_count: usize,
    failed_index: Option<usize>,
    error: &EngineError,
    attempted: &BTreeSet<usize>,
) -> BundleResponse {
    let entries = (0..entry_count)
        .map(|index| {
            if Some(index) == failed_index {
                error_entry(index, error)
            } else if attempted.contains(&index) {
                ResponseEntry::error(
                    index,
                    Status::FAILED_DEPENDENCY,
                    Diagnostic::error("transient", "rolled back"),
                )
            } else {
                ResponseEntry::error(
                    index,
                    Status::FAILED_DEPENDENCY,
                    Diagnostic::error("transient", "not attempted"),
                )
            }
        })
        .collect();
    BundleResponse {
        bundle_type: BundleType::TransactionResponse,
        outcome: Some(transaction_outcome(error)),
        entries,
    }
}
