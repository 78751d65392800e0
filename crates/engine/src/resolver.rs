//! Resolution and checking of references embedded in stored resources.
//!
//! Resolution rewrites bundle-local and indirect references into literal
//! `Type/id` form. Checking classifies the same way but never mutates.

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;
use versa_core::reference::extract_references;
use versa_core::url::QueryParams;
use versa_core::{ReferenceKind, Resource, ResourceReference};
use versa_storage::VersionedStore;

use crate::command::ExecutionEnv;
use crate::error::EngineError;
use crate::id_table::IdTranslationTable;

/// Upper bound on candidates fetched for an identifier lookup before read
/// authorization is applied.
const LOGICAL_CANDIDATE_LIMIT: usize = 64;

pub struct ReferenceResolver<'e, 'a> {
    env: &'e ExecutionEnv<'a>,
    conn: &'e Connection,
    index: usize,
}

impl<'e, 'a> ReferenceResolver<'e, 'a> {
    pub fn new(env: &'e ExecutionEnv<'a>, conn: &'e Connection, index: usize) -> Self {
        Self { env, conn, index }
    }

    /// Rewrites every reference in `resource` that is not already in
    /// canonical form. Returns true if anything changed.
    pub fn resolve(&self, ids: &IdTranslationTable, resource: &mut Resource) -> Result<bool, EngineError> {
        let classifier = self.env.classifier();
        let mut changed = false;
        for reference in extract_references(resource) {
            let literal = match classifier.classify(&reference) {
                ReferenceKind::Temporary => Some(self.resolve_temporary(ids, &reference)?),
                ReferenceKind::LiteralInternal => Some(self.resolve_literal(&reference)?),
                ReferenceKind::LiteralExternal => None,
                ReferenceKind::Logical => Some(self.resolve_logical(&reference)?),
                ReferenceKind::Conditional => Some(self.resolve_conditional(&reference)?),
                ReferenceKind::Unknown => return Err(self.unknown(&reference)),
            };
            if let Some(literal) = literal {
                changed |= set_reference(resource, &reference, &literal)?;
            }
        }
        if changed {
            debug!(
                target: "versa::refs",
                index = self.index,
                resource_type = %resource.resource_type,
                id = resource.id.as_deref().unwrap_or_default(),
                "references rewritten"
            );
        }
        Ok(changed)
    }

    /// Verifies every reference in a stored resource without rewriting it.
    /// Bundle-local forms must not survive resolution.
    pub fn check(&self, resource: &Resource) -> Result<(), EngineError> {
        let classifier = self.env.classifier();
        for reference in extract_references(resource) {
            match classifier.classify(&reference) {
                ReferenceKind::LiteralInternal => {
                    self.resolve_literal(&reference)?;
                }
                ReferenceKind::Logical => {
                    self.resolve_logical(&reference)?;
                }
                ReferenceKind::LiteralExternal => {}
                ReferenceKind::Temporary | ReferenceKind::Conditional | ReferenceKind::Unknown => {
                    return Err(self.unknown(&reference));
                }
            }
        }
        Ok(())
    }

    fn resolve_temporary(&self, ids: &IdTranslationTable, reference: &ResourceReference) -> Result<String, EngineError> {
        let literal = reference.reference.as_deref().unwrap_or_default();
        let key = ids.lookup(literal).ok_or_else(|| self.unknown(reference))?;
        if !self.env.typed(&key.resource_type)?.exists_live(self.conn, &key.id, None)? {
            return Err(self.unresolved(reference, format!("{key} does not exist")));
        }
        Ok(key.literal())
    }

    fn resolve_literal(&self, reference: &ResourceReference) -> Result<String, EngineError> {
        let literal = reference.reference.as_deref().unwrap_or_default();
        let parsed = self
            .env
            .classifier()
            .parse_literal(literal)
            .ok_or_else(|| self.unknown(reference))?;
        let exists = self
            .env
            .typed(&parsed.resource_type)?
            .exists_live(self.conn, &parsed.id, parsed.version)?;
        if !exists {
            return Err(self.unresolved(reference, format!("{} does not exist", parsed.relative())));
        }
        Ok(parsed.relative())
    }

    fn resolve_conditional(&self, reference: &ResourceReference) -> Result<String, EngineError> {
        let literal = reference.reference.as_deref().unwrap_or_default();
        let conditional = self
            .env
            .classifier()
            .parse_conditional(literal)
            .ok_or_else(|| self.unknown(reference))?;
        let page = self
            .env
            .search_by_condition(self.conn, &conditional.resource_type, &conditional.query, 2)?;
        match page.resources.as_slice() {
            [found] if page.total == 1 => Ok(format!(
                "{}/{}",
                conditional.resource_type,
                found.id.as_deref().unwrap_or_default()
            )),
            _ if page.total == 0 => Err(self.unresolved(reference, "no resource matches".into())),
            _ => Err(self.unresolved(reference, format!("{} resources match", page.total))),
        }
    }

    /// Identifier lookup restricted to what the current user may read.
    fn resolve_logical(&self, reference: &ResourceReference) -> Result<String, EngineError> {
        let (Some(resource_type), Some(identifier)) = (&reference.target_type, &reference.identifier) else {
            return Err(self.unknown(reference));
        };
        let mut query = QueryParams::new();
        query.insert(
            "identifier".to_string(),
            vec![format!("{}|{}", identifier.system, identifier.value)],
        );
        let page = self
            .env
            .search_by_condition(self.conn, resource_type, &query, LOGICAL_CANDIDATE_LIMIT)?;
        if page.total == 0 {
            return Err(self.unresolved(reference, "no resource has this identifier".into()));
        }

        let readable: Vec<&Resource> = page
            .resources
            .iter()
            .filter(|r| self.env.access.reason_read_allowed(self.env.user, r).is_some())
            .collect();
        match readable.as_slice() {
            [] => Err(EngineError::Forbidden(format!(
                "{} may not read the {resource_type} identified by {}|{}",
                self.env.user.name, identifier.system, identifier.value
            ))),
            [found] => Ok(format!(
                "{resource_type}/{}",
                found.id.as_deref().unwrap_or_default()
            )),
            many => Err(self.unresolved(reference, format!("{} resources have this identifier", many.len()))),
        }
    }

    fn location(&self, reference: &ResourceReference) -> String {
        format!("Bundle.entry[{}].{}", self.index, reference.location)
    }

    fn unknown(&self, reference: &ResourceReference) -> EngineError {
        EngineError::UnknownReference {
            location: self.location(reference),
            reference: reference.to_string(),
        }
    }

    fn unresolved(&self, reference: &ResourceReference, reason: String) -> EngineError {
        EngineError::ReferenceNotResolved {
            location: self.location(reference),
            reference: reference.to_string(),
            reason,
        }
    }
}

/// Sets the `reference` member of the object at the reference's pointer.
fn set_reference(resource: &mut Resource, reference: &ResourceReference, literal: &str) -> Result<bool, EngineError> {
    let Some(Value::Object(object)) = resource.pointer_mut(&reference.pointer) else {
        return Err(EngineError::Internal(format!(
            "reference at {} vanished during resolution",
            reference.pointer
        )));
    };
    if object.get("reference").and_then(Value::as_str) == Some(literal) {
        return Ok(false);
    }
    object.insert("reference".to_string(), Value::String(literal.to_string()));
    Ok(true)
}
