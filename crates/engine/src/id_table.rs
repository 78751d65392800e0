use std::collections::HashMap;
use std::fmt;

use versa_core::ResourceId;

use crate::error::EngineError;

/// A permanent `(type, id)` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }

    /// Relative literal reference, `Type/id`.
    pub fn literal(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Bound(ResourceKey),
    /// Registered by a conditional entry whose target is only known once its
    /// condition has been evaluated.
    Pending { resource_type: String },
}

/// Maps bundle-local temporary references to permanent ids.
///
/// Keys are registered during pre-execute. Unconditional entries are bound
/// to a fresh id right away; conditional entries are bound exactly once by
/// their owning command during execute. A key is never bound to two ids.
#[derive(Debug, Clone, Default)]
pub struct IdTranslationTable {
    entries: HashMap<String, Slot>,
}

impl IdTranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `full_url` and binds it to a freshly generated id.
    pub fn reserve(&mut self, full_url: &str, resource_type: &str) -> Result<ResourceKey, EngineError> {
        self.check_unused(full_url)?;
        let key = ResourceKey::new(resource_type, &ResourceId::new().to_string());
        self.entries
            .insert(full_url.to_string(), Slot::Bound(key.clone()));
        Ok(key)
    }

    pub fn register_pending(&mut self, full_url: &str, resource_type: &str) -> Result<(), EngineError> {
        self.check_unused(full_url)?;
        self.entries.insert(
            full_url.to_string(),
            Slot::Pending {
                resource_type: resource_type.to_string(),
            },
        );
        Ok(())
    }

    /// Binds a pending entry to `id`. Binding an entry to the id it already
    /// has is a no-op.
    pub fn bind(&mut self, full_url: &str, id: &str) -> Result<ResourceKey, EngineError> {
        match self.entries.get(full_url) {
            None => Err(EngineError::Internal(format!("{full_url} was never registered"))),
            Some(Slot::Bound(key)) if key.id == id => Ok(key.clone()),
            Some(Slot::Bound(key)) => Err(EngineError::Internal(format!(
                "{full_url} is already bound to {key}"
            ))),
            Some(Slot::Pending { resource_type }) => {
                let key = ResourceKey::new(resource_type, id);
                self.entries
                    .insert(full_url.to_string(), Slot::Bound(key.clone()));
                Ok(key)
            }
        }
    }

    /// Binds a pending entry to a freshly generated id.
    pub fn bind_fresh(&mut self, full_url: &str) -> Result<ResourceKey, EngineError> {
        self.bind(full_url, &ResourceId::new().to_string())
    }

    pub fn lookup(&self, full_url: &str) -> Option<&ResourceKey> {
        match self.entries.get(full_url) {
            Some(Slot::Bound(key)) => Some(key),
            _ => None,
        }
    }

    pub fn contains(&self, full_url: &str) -> bool {
        self.entries.contains_key(full_url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_unused(&self, full_url: &str) -> Result<(), EngineError> {
        if self.entries.contains_key(full_url) {
            return Err(EngineError::bad_request(format!(
                "fullUrl {full_url} is used by more than one entry"
            )));
        }
        Ok(())
    }
}
