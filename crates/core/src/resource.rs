use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CoreError;

/// Resource metadata. `versionId` and `lastUpdated` are owned by the store;
/// anything else a client sends (profiles, tags, security labels) is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(
        rename = "versionId",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "version_id::deserialize"
    )]
    pub version: Option<u64>,
    #[serde(rename = "lastUpdated", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    fn is_empty(&self) -> bool {
        self.version.is_none() && self.last_modified.is_none() && self.extra.is_empty()
    }
}

mod version_id {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    /// Accepts a number or a decimal string. Other client-supplied values are
    /// dropped, since the store assigns versions itself.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Number(n)) => Some(n),
            Some(Raw::Text(s)) => s.parse().ok(),
            None => None,
        })
    }
}

/// A typed document. Only the envelope (`resourceType`, `id`, `meta`) is
/// interpreted; everything else is carried in `body` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            meta: None,
            body: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        serde_json::from_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn version(&self) -> Option<u64> {
        self.meta.as_ref().and_then(|m| m.version)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.meta.as_ref().and_then(|m| m.last_modified)
    }

    /// Sets the store-owned envelope, keeping the rest of `meta`.
    pub fn stamp(&mut self, id: impl Into<String>, version: u64, last_modified: DateTime<Utc>) {
        self.id = Some(id.into());
        let meta = self.meta.get_or_insert_with(Meta::default);
        meta.version = Some(version);
        meta.last_modified = Some(last_modified);
    }

    /// Drops the id and any client-supplied version stamp before the store
    /// assigns its own.
    pub fn clear_stamp(&mut self) {
        self.id = None;
        if let Some(meta) = &mut self.meta {
            meta.version = None;
            meta.last_modified = None;
            if meta.is_empty() {
                self.meta = None;
            }
        }
    }

    /// Weak entity tag for the stored version, `W/"n"`.
    pub fn etag(&self) -> Option<String> {
        self.version().map(weak_etag)
    }

    /// Resolves a JSON pointer rooted at the resource body.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let (key, tail) = split_pointer(pointer)?;
        let value = self.body.get(&key)?;
        if tail.is_empty() {
            Some(value)
        } else {
            value.pointer(tail)
        }
    }

    pub fn pointer_mut(&mut self, pointer: &str) -> Option<&mut Value> {
        let (key, tail) = split_pointer(pointer)?;
        let value = self.body.get_mut(&key)?;
        if tail.is_empty() {
            Some(value)
        } else {
            value.pointer_mut(tail)
        }
    }
}

pub fn weak_etag(version: u64) -> String {
    format!("W/\"{version}\"")
}

/// Accepts `W/"n"`, `"n"` and bare `n`.
pub fn parse_etag(etag: &str) -> Option<u64> {
    let trimmed = etag.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    let trimmed = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    trimmed.parse().ok()
}

fn split_pointer(pointer: &str) -> Option<(String, &str)> {
    let rest = pointer.strip_prefix('/')?;
    let (head, tail) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    Some((head.replace("~1", "/").replace("~0", "~"), tail))
}
