use std::collections::BTreeMap;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchParamKind {
    /// Exact match on a scalar code.
    Token,
    /// Case-insensitive prefix match, `:exact` for equality.
    String,
    /// `system|value` match against an array of identifiers.
    Identifier,
    /// `Type/id` match against a reference object's `reference` member.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParamDef {
    pub name: String,
    pub kind: SearchParamKind,
    /// SQLite JSON path into the stored payload, e.g. `$.status`.
    pub path: String,
}

impl SearchParamDef {
    pub fn new(name: &str, kind: SearchParamKind, path: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            path: path.to_string(),
        }
    }
}

/// Everything the generic store and query compiler need to know about one
/// resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTypeDescriptor {
    pub name: String,
    pub table: String,
    pub search_params: Vec<SearchParamDef>,
}

impl ResourceTypeDescriptor {
    /// Creates a descriptor whose table name is derived from the type name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table_name_for(name),
            search_params: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_search_param(mut self, name: &str, kind: SearchParamKind, path: &str) -> Self {
        self.search_params.push(SearchParamDef::new(name, kind, path));
        self
    }

    pub fn search_param(&self, name: &str) -> Option<&SearchParamDef> {
        self.search_params.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !is_type_name(&self.name) {
            return Err(CoreError::InvalidDescriptor(format!(
                "resource type name must match [A-Z][A-Za-z]*: {}",
                self.name
            )));
        }
        if !is_table_name(&self.table) {
            return Err(CoreError::InvalidDescriptor(format!(
                "table name must match [a-z][a-z0-9_]*: {}",
                self.table
            )));
        }
        for param in &self.search_params {
            if param.name.is_empty() || param.name.starts_with('_') {
                return Err(CoreError::InvalidDescriptor(format!(
                    "search parameter name is reserved or empty: {:?} on {}",
                    param.name, self.name
                )));
            }
            if !param.path.starts_with('$') {
                return Err(CoreError::InvalidDescriptor(format!(
                    "search parameter path must start with '$': {} on {}",
                    param.path, self.name
                )));
            }
        }
        Ok(())
    }
}

/// The set of resource types this store serves. Doubles as the list of known
/// type names used when classifying references.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, ResourceTypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ResourceTypeDescriptor) -> Result<(), CoreError> {
        descriptor.validate()?;
        if self.types.contains_key(&descriptor.name) {
            return Err(CoreError::DuplicateResourceType(descriptor.name));
        }
        if self.types.values().any(|d| d.table == descriptor.table) {
            return Err(CoreError::InvalidDescriptor(format!(
                "table {} already used by another type",
                descriptor.table
            )));
        }
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: ResourceTypeDescriptor) -> Result<Self, CoreError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ResourceTypeDescriptor> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceTypeDescriptor> {
        self.types.values()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// A registry with a handful of common clinical and organisational types.
    pub fn standard() -> Self {
        use SearchParamKind::{Identifier, Reference, Token};
        let text = SearchParamKind::String;

        let descriptors = [
            ResourceTypeDescriptor::new("Patient")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("family", text, "$.name[0].family")
                .with_search_param("active", Token, "$.active")
                .with_search_param("organization", Reference, "$.managingOrganization"),
            ResourceTypeDescriptor::new("Organization")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("name", text, "$.name")
                .with_search_param("active", Token, "$.active")
                .with_search_param("endpoint", Reference, "$.endpoint[0]"),
            ResourceTypeDescriptor::new("Practitioner")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("family", text, "$.name[0].family"),
            ResourceTypeDescriptor::new("Endpoint")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("address", text, "$.address")
                .with_search_param("status", Token, "$.status")
                .with_search_param("organization", Reference, "$.managingOrganization"),
            ResourceTypeDescriptor::new("Observation")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("status", Token, "$.status")
                .with_search_param("subject", Reference, "$.subject"),
            ResourceTypeDescriptor::new("Task")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("status", Token, "$.status")
                .with_search_param("requester", Reference, "$.requester"),
            ResourceTypeDescriptor::new("Group")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("name", text, "$.name"),
            ResourceTypeDescriptor::new("ResearchStudy")
                .with_search_param("identifier", Identifier, "$.identifier")
                .with_search_param("status", Token, "$.status")
                .with_search_param("title", text, "$.title"),
        ];

        let mut registry = Self::new();
        for descriptor in descriptors {
            // built-ins are covered by standard_registry_registers_every_type
            let _ = registry.register(descriptor);
        }
        registry
    }
}

pub fn is_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphabetic())
}

fn is_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `ResearchStudy` becomes `research_studies`.
fn table_name_for(type_name: &str) -> String {
    let mut snake = String::with_capacity(type_name.len() + 4);
    for (i, c) in type_name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                snake.push('_');
            }
            snake.push(c.to_ascii_lowercase());
        } else {
            snake.push(c);
        }
    }
    if let Some(stem) = snake.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{snake}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_registers_every_type() {
        let registry = TypeRegistry::standard();
        let names: Vec<&str> = registry.type_names().collect();
        assert_eq!(
            names,
            [
                "Endpoint",
                "Group",
                "Observation",
                "Organization",
                "Patient",
                "Practitioner",
                "ResearchStudy",
                "Task"
            ]
        );
        assert_eq!(registry.get("ResearchStudy").unwrap().table, "research_studies");
        assert_eq!(registry.get("Patient").unwrap().table, "patients");
    }

    #[test]
    fn rejects_invalid_names() {
        let mut registry = TypeRegistry::new();
        assert!(registry.register(ResourceTypeDescriptor::new("patient")).is_err());
        assert!(registry
            .register(ResourceTypeDescriptor::new("Patient").with_table("patients; DROP"))
            .is_err());
        assert!(registry
            .register(ResourceTypeDescriptor::new("Patient").with_search_param(
                "_id",
                SearchParamKind::Token,
                "$.id"
            ))
            .is_err());
    }

    #[test]
    fn rejects_duplicates() {
        let mut registry = TypeRegistry::new();
        registry.register(ResourceTypeDescriptor::new("Patient")).unwrap();
        assert!(matches!(
            registry.register(ResourceTypeDescriptor::new("Patient")),
            Err(CoreError::DuplicateResourceType(_))
        ));
        assert!(registry
            .register(ResourceTypeDescriptor::new("Person").with_table("patients"))
            .is_err());
    }
}
