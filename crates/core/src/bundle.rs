use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Batch,
    Transaction,
    BatchResponse,
    TransactionResponse,
    Searchset,
    Collection,
}

impl BundleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Transaction => "transaction",
            Self::BatchResponse => "batch-response",
            Self::TransactionResponse => "transaction-response",
            Self::Searchset => "searchset",
            Self::Collection => "collection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRequest {
    pub method: Method,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl EntryRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            if_none_exist: None,
            if_match: None,
            if_none_match: None,
            if_modified_since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    pub request: EntryRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub bundle_type: Option<BundleType>,
    #[serde(rename = "entry", default)]
    pub entries: Vec<BundleEntry>,
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            bundle_type: Some(bundle_type),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: BundleEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnPreference {
    Minimal,
    #[default]
    Representation,
    OperationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Information,
    Warning,
    Error,
    Fatal,
}

/// Structured, client-facing description of an entry's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &str, text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            text: text.into(),
            location: None,
        }
    }

    pub fn information(code: &str, text: impl Into<String>) -> Self {
        Self {
            severity: Severity::Information,
            code: code.to_string(),
            text: text.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// An HTTP-style status line, e.g. `201 Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const CREATED: Status = Status(201);
    pub const NO_CONTENT: Status = Status(204);
    pub const NOT_MODIFIED: Status = Status(304);
    pub const FAILED_DEPENDENCY: Status = Status(424);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            410 => "Gone",
            412 => "Precondition Failed",
            424 => "Failed Dependency",
            _ => "Internal Server Error",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    pub index: usize,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Diagnostic>,
}

impl ResponseEntry {
    pub fn new(index: usize, status: Status) -> Self {
        Self {
            index,
            status,
            full_url: None,
            location: None,
            etag: None,
            last_modified: None,
            resource: None,
            outcome: None,
        }
    }

    pub fn error(index: usize, status: Status, diagnostic: Diagnostic) -> Self {
        Self {
            outcome: Some(diagnostic),
            ..Self::new(index, status)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Whole-bundle failure of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorOutcome {
    pub status: Status,
    pub diagnostic: Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleResponse {
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ErrorOutcome>,
    #[serde(rename = "entry")]
    pub entries: Vec<ResponseEntry>,
}

impl BundleResponse {
    pub fn entry(&self, index: usize) -> Option<&ResponseEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_none() && self.entries.iter().all(ResponseEntry::is_success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundle_deserializes_from_wire_json() {
        let bundle: Bundle = serde_json::from_value(json!({
            "type": "transaction",
            "entry": [{
                "fullUrl": "urn:uuid:5d0c7a8e-0c53-4a43-9a43-3f63c2f3b3e1",
                "resource": {"resourceType": "Patient", "active": true},
                "request": {"method": "POST", "url": "Patient", "ifNoneExist": "identifier=http://sys|1"}
            }]
        }))
        .unwrap();
        assert_eq!(bundle.bundle_type, Some(BundleType::Transaction));
        let entry = &bundle.entries[0];
        assert_eq!(entry.request.method, Method::Post);
        assert_eq!(entry.request.if_none_exist.as_deref(), Some("identifier=http://sys|1"));
        assert_eq!(entry.resource.as_ref().unwrap().resource_type, "Patient");
    }

    #[test]
    fn missing_bundle_type_is_preserved_as_none() {
        let bundle: Bundle = serde_json::from_value(json!({"entry": []})).unwrap();
        assert!(bundle.bundle_type.is_none());
    }

    #[test]
    fn status_renders_as_status_line() {
        assert_eq!(Status::CREATED.to_string(), "201 Created");
        assert_eq!(Status(412).to_string(), "412 Precondition Failed");
        assert_eq!(
            serde_json::to_value(Status::NO_CONTENT).unwrap(),
            json!("204 No Content")
        );
    }
}
