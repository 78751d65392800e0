use versa_core::{Bundle, BundleEntry, BundleType, EntryRequest, Method, Resource, ResourceId};

/// A fresh bundle-local placeholder, `urn:uuid:...`.
pub fn temp_url() -> String {
    format!("urn:uuid:{}", ResourceId::new())
}

pub fn transaction(entries: Vec<BundleEntry>) -> Bundle {
    Bundle {
        bundle_type: Some(BundleType::Transaction),
        entries,
    }
}

pub fn batch(entries: Vec<BundleEntry>) -> Bundle {
    Bundle {
        bundle_type: Some(BundleType::Batch),
        entries,
    }
}

/// `POST {type}` with `full_url` as the placeholder for the new resource.
pub fn create_entry(full_url: &str, resource: Resource) -> BundleEntry {
    BundleEntry {
        full_url: Some(full_url.to_string()),
        request: EntryRequest::new(Method::Post, resource.resource_type.clone()),
        resource: Some(resource),
    }
}

pub fn conditional_create_entry(full_url: &str, resource: Resource, if_none_exist: &str) -> BundleEntry {
    let mut entry = create_entry(full_url, resource);
    entry.request.if_none_exist = Some(if_none_exist.to_string());
    entry
}

/// `PUT {type}/{id}` for a resource that carries its id.
pub fn update_entry(resource: Resource) -> BundleEntry {
    let url = format!(
        "{}/{}",
        resource.resource_type,
        resource.id.as_deref().unwrap_or_default()
    );
    BundleEntry {
        full_url: None,
        request: EntryRequest::new(Method::Put, url),
        resource: Some(resource),
    }
}

pub fn update_if_match_entry(resource: Resource, if_match: &str) -> BundleEntry {
    let mut entry = update_entry(resource);
    entry.request.if_match = Some(if_match.to_string());
    entry
}

/// `PUT {type}?{query}`.
pub fn conditional_update_entry(full_url: Option<&str>, resource: Resource, query: &str) -> BundleEntry {
    BundleEntry {
        full_url: full_url.map(str::to_string),
        request: EntryRequest::new(Method::Put, format!("{}?{query}", resource.resource_type)),
        resource: Some(resource),
    }
}

pub fn delete_entry(url: &str) -> BundleEntry {
    BundleEntry {
        full_url: None,
        resource: None,
        request: EntryRequest::new(Method::Delete, url),
    }
}

pub fn read_entry(url: &str) -> BundleEntry {
    BundleEntry {
        full_url: None,
        resource: None,
        request: EntryRequest::new(Method::Get, url),
    }
}

/// A resource carrying a single `identifier` entry.
pub fn with_identifier(resource: Resource, system: &str, value: &str) -> Resource {
    resource.with_field(
        "identifier",
        serde_json::json!([{ "system": system, "value": value }]),
    )
}
