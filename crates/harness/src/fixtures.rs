use std::collections::BTreeSet;
use std::sync::Mutex;

use versa_core::Resource;
use versa_engine::{AccessRules, Event, EventError, EventHandler, EventKind, User};

/// Keeps every delivered event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<(EventKind, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.kind, e.resource_type))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventHandler for RecordingEvents {
    fn handle_event(&self, event: &Event) -> Result<(), EventError> {
        self.events
            .lock()
            .map_err(|_| EventError("recorder poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

/// Access rules that deny chosen operations per resource type.
#[derive(Debug, Default)]
pub struct ScriptedAccess {
    deny_create: BTreeSet<String>,
    deny_read: BTreeSet<String>,
    deny_update: BTreeSet<String>,
    deny_delete: BTreeSet<String>,
}

impl ScriptedAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_create(mut self, resource_type: &str) -> Self {
        self.deny_create.insert(resource_type.to_string());
        self
    }

    pub fn deny_read(mut self, resource_type: &str) -> Self {
        self.deny_read.insert(resource_type.to_string());
        self
    }

    pub fn deny_update(mut self, resource_type: &str) -> Self {
        self.deny_update.insert(resource_type.to_string());
        self
    }

    pub fn deny_delete(mut self, resource_type: &str) -> Self {
        self.deny_delete.insert(resource_type.to_string());
        self
    }
}

fn decide(denied: &BTreeSet<String>, resource: &Resource) -> Option<String> {
    if denied.contains(&resource.resource_type) {
        None
    } else {
        Some("not scripted to deny".into())
    }
}

impl AccessRules for ScriptedAccess {
    fn reason_create_allowed(&self, _user: &User, resource: &Resource) -> Option<String> {
        decide(&self.deny_create, resource)
    }

    fn reason_read_allowed(&self, _user: &User, resource: &Resource) -> Option<String> {
        decide(&self.deny_read, resource)
    }

    fn reason_update_allowed(&self, _user: &User, old: &Resource, _new: &Resource) -> Option<String> {
        decide(&self.deny_update, old)
    }

    fn reason_delete_allowed(&self, _user: &User, old: &Resource) -> Option<String> {
        decide(&self.deny_delete, old)
    }
}
