use thiserror::Error;
use tracing::error;
use versa_core::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub resource_type: String,
    pub id: String,
    pub resource: Option<Resource>,
}

impl Event {
    pub fn created(resource: &Resource) -> Self {
        Self::with_resource(EventKind::Created, resource)
    }

    pub fn updated(resource: &Resource) -> Self {
        Self::with_resource(EventKind::Updated, resource)
    }

    pub fn deleted(resource_type: &str, id: &str) -> Self {
        Self {
            kind: EventKind::Deleted,
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            resource: None,
        }
    }

    fn with_resource(kind: EventKind, resource: &Resource) -> Self {
        Self {
            kind,
            resource_type: resource.resource_type.clone(),
            id: resource.id.clone().unwrap_or_default(),
            resource: Some(resource.clone()),
        }
    }
}

#[derive(Debug, Error)]
#[error("event delivery failed: {0}")]
pub struct EventError(pub String);

/// Receives notifications for successful creates, updates and deletes.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event) -> Result<(), EventError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventHandler;

impl EventHandler for NoopEventHandler {
    fn handle_event(&self, _event: &Event) -> Result<(), EventError> {
        Ok(())
    }
}

/// Where commands put events during post-execute.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

/// Delivers immediately. Used by batches, where each entry commits on its own.
pub struct DirectEvents<'a> {
    handler: &'a dyn EventHandler,
}

impl<'a> DirectEvents<'a> {
    pub fn new(handler: &'a dyn EventHandler) -> Self {
        Self { handler }
    }
}

impl EventSink for DirectEvents<'_> {
    fn emit(&mut self, event: Event) {
        deliver(self.handler, &event);
    }
}

/// Holds events until the surrounding transaction commits. Dropping it
/// discards them.
#[derive(Debug, Default)]
pub struct TransactionEvents {
    pending: Vec<Event>,
}

impl TransactionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Call only after a successful commit.
    pub fn release(self, handler: &dyn EventHandler) {
        for event in &self.pending {
            deliver(handler, event);
        }
    }
}

impl EventSink for TransactionEvents {
    fn emit(&mut self, event: Event) {
        self.pending.push(event);
    }
}

fn deliver(handler: &dyn EventHandler, event: &Event) {
    if let Err(e) = handler.handle_event(event) {
        error!(
            target: "versa::events",
            kind = ?event.kind,
            resource_type = %event.resource_type,
            id = %event.id,
            error = %e,
            "event handler failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Event>>);

    impl EventHandler for Collect {
        fn handle_event(&self, event: &Event) -> Result<(), EventError> {
            self.0.lock().map_err(|e| EventError(e.to_string()))?.push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn handle_event(&self, _event: &Event) -> Result<(), EventError> {
            Err(EventError("broker down".into()))
        }
    }

    #[test]
    fn transaction_events_are_held_until_release() {
        let handler = Collect::default();
        let mut events = TransactionEvents::new();
        events.emit(Event::deleted("Patient", "1"));
        events.emit(Event::deleted("Patient", "2"));
        assert_eq!(events.len(), 2);
        assert!(handler.0.lock().unwrap().is_empty());

        events.release(&handler);
        let delivered = handler.0.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].id, "2");
    }

    #[test]
    fn dropped_transaction_events_are_never_delivered() {
        let handler = Collect::default();
        let mut events = TransactionEvents::new();
        events.emit(Event::deleted("Patient", "1"));
        drop(events);
        assert!(handler.0.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_failures_are_swallowed() {
        let mut direct = DirectEvents::new(&Failing);
        direct.emit(Event::deleted("Patient", "1"));
    }
}
