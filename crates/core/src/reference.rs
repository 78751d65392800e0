use serde_json::Value;

use crate::descriptor::TypeRegistry;
use crate::resource::Resource;
use crate::url::{QueryParams, parse_query};

const HISTORY_MARKER: &str = "/_history/";
const MAX_ID_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Temporary,
    LiteralInternal,
    LiteralExternal,
    Logical,
    Conditional,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub system: String,
    pub value: String,
}

/// One structured reference found inside a resource payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    /// Human-readable location, e.g. `Observation.subject`.
    pub location: String,
    /// JSON pointer to the reference object, relative to the resource body.
    pub pointer: String,
    pub reference: Option<String>,
    pub target_type: Option<String>,
    pub identifier: Option<Identifier>,
}

impl ResourceReference {
    /// The pointer to this reference's `reference` member.
    pub fn reference_pointer(&self) -> String {
        format!("{}/reference", self.pointer)
    }
}

impl std::fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.reference, &self.target_type, &self.identifier) {
            (Some(reference), _, _) => write!(f, "{reference}"),
            (None, Some(ty), Some(identifier)) => {
                write!(f, "{ty}?identifier={}|{}", identifier.system, identifier.value)
            }
            _ => write!(f, "<empty reference>"),
        }
    }
}

/// A `{base}/{type}/{id}[/_history/{version}]` pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralReference {
    pub base: Option<String>,
    pub resource_type: String,
    pub id: String,
    pub version: Option<u64>,
}

impl LiteralReference {
    /// Relative form without the base, used as the canonical stored form for
    /// references to this store.
    pub fn relative(&self) -> String {
        match self.version {
            Some(v) => format!("{}/{}/_history/{v}", self.resource_type, self.id),
            None => format!("{}/{}", self.resource_type, self.id),
        }
    }
}

/// A `{type}?{query}` reference, only meaningful inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalReference {
    pub resource_type: String,
    pub query: QueryParams,
}

/// Walks a resource body and collects every structured reference. Objects
/// count as references when they carry a string `reference` member, or a
/// string `type` plus an `identifier` with both `system` and `value`. Plain
/// `url` members (attachments, related artifacts) are not references.
pub fn extract_references(resource: &Resource) -> Vec<ResourceReference> {
    let mut found = Vec::new();
    for (key, value) in &resource.body {
        let pointer = format!("/{}", escape_token(key));
        let location = format!("{}.{key}", resource.resource_type);
        walk(value, &pointer, &location, &mut found);
    }
    found
}

fn walk(value: &Value, pointer: &str, location: &str, found: &mut Vec<ResourceReference>) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = as_reference(map, pointer, location) {
                found.push(reference);
                return;
            }
            for (key, child) in map {
                walk(
                    child,
                    &format!("{pointer}/{}", escape_token(key)),
                    &format!("{location}.{key}"),
                    found,
                );
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(child, &format!("{pointer}/{i}"), location, found);
            }
        }
        _ => {}
    }
}

fn as_reference(
    map: &serde_json::Map<String, Value>,
    pointer: &str,
    location: &str,
) -> Option<ResourceReference> {
    let reference = map.get("reference").and_then(Value::as_str).map(str::to_string);
    let target_type = map.get("type").and_then(Value::as_str).map(str::to_string);
    let identifier = map.get("identifier").and_then(|i| {
        let system = i.get("system")?.as_str()?;
        let value = i.get("value")?.as_str()?;
        Some(Identifier {
            system: system.to_string(),
            value: value.to_string(),
        })
    });

    let logical = target_type.is_some() && identifier.is_some();
    if reference.is_none() && !logical {
        return None;
    }
    Some(ResourceReference {
        location: location.to_string(),
        pointer: pointer.to_string(),
        reference,
        target_type,
        identifier,
    })
}

fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Classifies references against the registered type names, this store's
/// base location and the bundle's temporary prefix.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceClassifier<'a> {
    registry: &'a TypeRegistry,
    server_base: &'a str,
    temporary_prefix: &'a str,
}

impl<'a> ReferenceClassifier<'a> {
    pub fn new(registry: &'a TypeRegistry, server_base: &'a str, temporary_prefix: &'a str) -> Self {
        Self {
            registry,
            server_base: server_base.trim_end_matches('/'),
            temporary_prefix,
        }
    }

    pub fn classify(&self, reference: &ResourceReference) -> ReferenceKind {
        match &reference.reference {
            Some(literal) => self.classify_literal(literal),
            None => match (&reference.target_type, &reference.identifier) {
                (Some(ty), Some(identifier))
                    if self.registry.contains(ty)
                        && !identifier.system.is_empty()
                        && !identifier.value.is_empty() =>
                {
                    ReferenceKind::Logical
                }
                _ => ReferenceKind::Unknown,
            },
        }
    }

    pub fn classify_literal(&self, literal: &str) -> ReferenceKind {
        if self.is_temporary(literal) {
            return ReferenceKind::Temporary;
        }
        if let Some(parsed) = self.parse_literal(literal) {
            return match parsed.base.as_deref() {
                None => ReferenceKind::LiteralInternal,
                Some(base) if base == self.server_base => ReferenceKind::LiteralInternal,
                Some(_) => ReferenceKind::LiteralExternal,
            };
        }
        if self.parse_conditional(literal).is_some() {
            return ReferenceKind::Conditional;
        }
        ReferenceKind::Unknown
    }

    pub fn is_temporary(&self, literal: &str) -> bool {
        !self.temporary_prefix.is_empty()
            && literal.len() > self.temporary_prefix.len()
            && literal.starts_with(self.temporary_prefix)
    }

    pub fn parse_literal(&self, literal: &str) -> Option<LiteralReference> {
        if literal.contains('?') || literal.contains('#') {
            return None;
        }
        let (path, version) = match literal.rsplit_once(HISTORY_MARKER) {
            Some((path, version)) => (path, Some(version.parse::<u64>().ok()?)),
            None => (literal, None),
        };

        let (rest, id) = path.rsplit_once('/')?;
        let (base, resource_type) = match rest.rsplit_once('/') {
            Some((base, ty)) => (Some(base), ty),
            None => (None, rest),
        };

        if !self.registry.contains(resource_type) || !is_valid_id(id) {
            return None;
        }
        let base = match base {
            Some(base) if base.starts_with("http://") || base.starts_with("https://") => {
                Some(base.trim_end_matches('/').to_string())
            }
            Some(_) => return None,
            None => None,
        };

        Some(LiteralReference {
            base,
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version,
        })
    }

    pub fn parse_conditional(&self, literal: &str) -> Option<ConditionalReference> {
        let (resource_type, query) = literal.split_once('?')?;
        if !self.registry.contains(resource_type) {
            return None;
        }
        let query = parse_query(query);
        if query.is_empty() {
            return None;
        }
        Some(ConditionalReference {
            resource_type: resource_type.to_string(),
            query,
        })
    }
}

pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
