use std::collections::BTreeMap;
use std::fmt;

use crate::CoreError;

/// Multi-valued query parameters, keyed by name (including any `:modifier`).
pub type QueryParams = BTreeMap<String, Vec<String>>;

/// The relative URL of a bundle entry request: `Type`, `Type/id`,
/// `Type/id/_history/v` or `Type?query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUrl {
    segments: Vec<String>,
    query: Option<QueryParams>,
    raw: String,
}

impl RequestUrl {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidUrl("empty request url".into()));
        }
        if trimmed.contains("://") {
            return Err(CoreError::InvalidUrl(format!(
                "request url must be relative: {trimmed}"
            )));
        }

        let (path, query) = match trimmed.split_once('?') {
            Some((path, query)) => (path, Some(parse_query(query))),
            None => (trimmed, None),
        };

        let path = path.trim_matches('/');
        let segments = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').map(percent_decode).collect::<Vec<_>>()
        };
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CoreError::InvalidUrl(format!("empty path segment in {trimmed}")));
        }

        Ok(Self {
            segments,
            query,
            raw: trimmed.to_string(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn has_query(&self) -> bool {
        self.query.is_some()
    }

    pub fn query(&self) -> Option<&QueryParams> {
        self.query.as_ref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn parse_query(query: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(percent_decode(key))
            .or_default()
            .push(percent_decode(value));
    }
    params
}

/// Decodes `%XX` escapes and `+`. Malformed escapes are kept literally.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
