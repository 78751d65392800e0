use versa_core::{QueryParams, ResourceTypeDescriptor, SearchParamKind};

pub const PARAMETER_ID: &str = "_id";
pub const PARAMETER_COUNT: &str = "_count";
pub const PARAMETER_PAGE: &str = "_page";
pub const PARAMETER_SORT: &str = "_sort";
pub const PARAMETER_INCLUDE: &str = "_include";
pub const PARAMETER_FORMAT: &str = "_format";
pub const PARAMETER_PRETTY: &str = "_pretty";

/// Parameters that shape the result page rather than filter it.
pub const STANDARD_PARAMETERS: [&str; 6] = [
    PARAMETER_SORT,
    PARAMETER_INCLUDE,
    PARAMETER_PAGE,
    PARAMETER_COUNT,
    PARAMETER_FORMAT,
    PARAMETER_PRETTY,
];

const DEFAULT_PAGE_COUNT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameterError {
    pub parameter: String,
    pub message: String,
}

impl std::fmt::Display for QueryParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.parameter, self.message)
    }
}

/// A search compiled to SQL predicates over the current, live rows of one
/// resource type. Predicates reference the version table as `r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub resource_type: String,
    pub predicates: Vec<String>,
    pub params: Vec<String>,
    /// One-based page number.
    pub page: usize,
    /// Page size. Zero means count only.
    pub count: usize,
    pub errors: Vec<QueryParameterError>,
}

impl CompiledQuery {
    pub fn new(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            predicates: Vec::new(),
            params: Vec::new(),
            page: 1,
            count: DEFAULT_PAGE_COUNT,
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.count
    }

    fn error(&mut self, parameter: &str, message: impl Into<String>) {
        self.errors.push(QueryParameterError {
            parameter: parameter.to_string(),
            message: message.into(),
        });
    }
}

/// Compiles multi-valued query parameters for one resource type into a
/// predicate set the store can execute.
pub trait QueryCompiler: Send + Sync {
    fn compile(&self, descriptor: &ResourceTypeDescriptor, params: &QueryParams) -> CompiledQuery;
}

/// Evaluates search parameters against the stored JSON payload with the
/// SQLite JSON functions, using the paths declared on the descriptor.
#[derive(Debug, Clone)]
pub struct JsonPathQueryCompiler {
    default_count: usize,
}

impl Default for JsonPathQueryCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_COUNT)
    }
}

impl JsonPathQueryCompiler {
    pub fn new(default_count: usize) -> Self {
        Self { default_count }
    }
}

impl QueryCompiler for JsonPathQueryCompiler {
    fn compile(&self, descriptor: &ResourceTypeDescriptor, params: &QueryParams) -> CompiledQuery {
        let mut query = CompiledQuery::new(&descriptor.name);
        query.count = self.default_count;

        for (key, values) in params {
            let (name, modifier) = match key.split_once(':') {
                Some((name, modifier)) => (name, Some(modifier)),
                None => (key.as_str(), None),
            };

            match name {
                PARAMETER_COUNT => match last_usize(values) {
                    Some(count) => query.count = count,
                    None => query.error(key, "expected a non-negative integer"),
                },
                PARAMETER_PAGE => match last_usize(values) {
                    Some(page) if page >= 1 => query.page = page,
                    _ => query.error(key, "expected a positive integer"),
                },
                PARAMETER_FORMAT | PARAMETER_PRETTY => {}
                PARAMETER_SORT | PARAMETER_INCLUDE => query.error(key, "not supported"),
                PARAMETER_ID => {
                    for value in values {
                        let alternatives = split_alternatives(value);
                        if alternatives.is_empty() {
                            query.error(key, "missing value");
                            continue;
                        }
                        let placeholders = vec!["?"; alternatives.len()].join(", ");
                        query.predicates.push(format!("r.id IN ({placeholders})"));
                        query.params.extend(alternatives);
                    }
                }
                _ => match descriptor.search_param(name) {
                    Some(param) => {
                        for value in values {
                            compile_value(&mut query, key, param.kind, &param.path, modifier, value);
                        }
                    }
                    None => query.error(
                        key,
                        format!("unsupported search parameter for {}", descriptor.name),
                    ),
                },
            }
        }

        query
    }
}

fn compile_value(
    query: &mut CompiledQuery,
    key: &str,
    kind: SearchParamKind,
    path: &str,
    modifier: Option<&str>,
    value: &str,
) {
    let alternatives = split_alternatives(value);
    if alternatives.is_empty() {
        query.error(key, "missing value");
        return;
    }

    let mut clauses = Vec::with_capacity(alternatives.len());
    let mut params = Vec::new();
    for alternative in alternatives {
        let clause = match (kind, modifier) {
            (SearchParamKind::Token, None) => {
                params.extend([path.to_string(), path.to_string(), alternative]);
                "(CASE json_type(r.payload, ?) WHEN 'true' THEN 'true' WHEN 'false' THEN 'false' \
                 ELSE CAST(json_extract(r.payload, ?) AS TEXT) END) = ?"
                    .to_string()
            }
            (SearchParamKind::String, None) => {
                params.extend([path.to_string(), format!("{}%", escape_like(&alternative.to_lowercase()))]);
                "lower(json_extract(r.payload, ?)) LIKE ? ESCAPE '\\'".to_string()
            }
            (SearchParamKind::String, Some("exact")) => {
                params.extend([path.to_string(), alternative]);
                "json_extract(r.payload, ?) = ?".to_string()
            }
            (SearchParamKind::Identifier, None) => match alternative.split_once('|') {
                Some((system, "")) => {
                    params.extend([path.to_string(), system.to_string()]);
                    "EXISTS (SELECT 1 FROM json_each(r.payload, ?) i \
                     WHERE json_extract(i.value, '$.system') = ?)"
                        .to_string()
                }
                Some(("", value)) => {
                    params.extend([path.to_string(), value.to_string()]);
                    "EXISTS (SELECT 1 FROM json_each(r.payload, ?) i \
                     WHERE json_extract(i.value, '$.system') IS NULL AND json_extract(i.value, '$.value') = ?)"
                        .to_string()
                }
                Some((system, value)) => {
                    params.extend([path.to_string(), system.to_string(), value.to_string()]);
                    "EXISTS (SELECT 1 FROM json_each(r.payload, ?) i \
                     WHERE json_extract(i.value, '$.system') = ? AND json_extract(i.value, '$.value') = ?)"
                        .to_string()
                }
                None => {
                    params.extend([path.to_string(), alternative]);
                    "EXISTS (SELECT 1 FROM json_each(r.payload, ?) i \
                     WHERE json_extract(i.value, '$.value') = ?)"
                        .to_string()
                }
            },
            (SearchParamKind::Reference, None) => {
                params.extend([format!("{path}.reference"), alternative]);
                "json_extract(r.payload, ?) = ?".to_string()
            }
            (_, Some(modifier)) => {
                query.error(key, format!("unsupported modifier :{modifier}"));
                return;
            }
        };
        clauses.push(clause);
    }

    if clauses.len() == 1 {
        query.predicates.extend(clauses);
    } else {
        query.predicates.push(format!("({})", clauses.join(" OR ")));
    }
    query.params.extend(params);
}

/// Splits on unescaped commas; `\,` keeps a literal comma.
fn split_alternatives(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts.retain(|p| !p.is_empty());
    parts
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn last_usize(values: &[String]) -> Option<usize> {
    values.last().and_then(|v| v.trim().parse().ok())
}

/// Removes paging and formatting parameters, returning the names removed.
/// Conditional operations only care about the filter.
pub fn strip_standard_parameters(params: &QueryParams) -> (QueryParams, Vec<String>) {
    let mut kept = QueryParams::new();
    let mut removed = Vec::new();
    for (key, values) in params {
        let name = key.split_once(':').map_or(key.as_str(), |(name, _)| name);
        if STANDARD_PARAMETERS.contains(&name) {
            removed.push(key.clone());
        } else {
            kept.insert(key.clone(), values.clone());
        }
    }
    (kept, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use versa_core::TypeRegistry;
    use versa_core::url::parse_query;

    fn compile(query: &str) -> CompiledQuery {
        let registry = TypeRegistry::standard();
        let descriptor = registry.get("Patient").unwrap();
        JsonPathQueryCompiler::default().compile(descriptor, &parse_query(query))
    }

    #[test]
    fn identifier_with_system_binds_path_system_and_value() {
        let query = compile("identifier=http://sys|42");
        assert!(!query.has_errors());
        assert_eq!(query.predicates.len(), 1);
        assert_eq!(query.params, ["$.identifier", "http://sys", "42"]);
    }

    #[test]
    fn comma_values_are_or_and_repeated_keys_are_and() {
        let query = compile("family=doe,roe&active=true&active=true");
        assert!(!query.has_errors());
        assert_eq!(query.predicates.len(), 3);
        // `active` sorts first; the comma alternatives of `family` form one OR group
        assert!(!query.predicates[0].contains(" OR "));
        assert!(query.predicates[2].contains(" OR "));
    }

    #[test]
    fn unknown_parameters_and_modifiers_are_reported() {
        let query = compile("shoe-size=42&family:contains=x&_sort=family");
        let names: Vec<&str> = query.errors.iter().map(|e| e.parameter.as_str()).collect();
        assert_eq!(names, ["_sort", "family:contains", "shoe-size"]);
    }

    #[test]
    fn paging_parameters_shape_the_page() {
        let query = compile("_count=5&_page=3");
        assert_eq!((query.count, query.page, query.offset()), (5, 3, 10));
        assert!(compile("_page=0").has_errors());
    }

    #[test]
    fn strip_standard_parameters_keeps_filters() {
        let (kept, removed) =
            strip_standard_parameters(&parse_query("identifier=a|b&_count=1&_sort=x&_format=json"));
        assert_eq!(kept.keys().collect::<Vec<_>>(), ["identifier"]);
        assert_eq!(removed, ["_count", "_format", "_sort"]);
    }

    #[test]
    fn escaped_commas_stay_literal() {
        assert_eq!(split_alternatives("a\\,b,c"), ["a,b", "c"]);
        assert!(split_alternatives(",").is_empty());
    }
}
