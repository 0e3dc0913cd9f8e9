//! Event bus abstraction for decoupled event emission.
//!
//! The model manager and the chat session publish snapshots through this
//! trait so that a UI, the CLI or a test can observe them without either
//! side knowing who is listening.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Trait for emitting events to subscribers.
pub trait EventBus: Send + Sync {
    /// Emit an event with a JSON payload.
    ///
    /// # Arguments
    /// * `topic` - Event name/topic (e.g., "models:state")
    /// * `payload` - JSON payload to emit
    fn emit(&self, topic: &str, payload: serde_json::Value);
}

/// Type alias for shared event bus reference.
pub type EventBusRef = Arc<dyn EventBus>;

/// Serialize a typed event and emit it.
///
/// Serialization failures are logged and dropped; an observer missing one
/// snapshot is preferable to the producer failing.
pub fn emit_event<T: Serialize>(bus: &dyn EventBus, topic: &str, event: &T) {
    match serde_json::to_value(event) {
        Ok(payload) => bus.emit(topic, payload),
        Err(e) => tracing::warn!(topic, error = %e, "Failed to serialize event"),
    }
}

/// Events recorded while a producer holds its own state lock, emitted after
/// that lock is released in the order they were recorded.
///
/// Handlers therefore run with no producer lock held and may read the
/// producer back. A handler that pushes more events has them delivered by
/// the flush already in progress.
pub struct EventQueue {
    bus: EventBusRef,
    pending: Mutex<VecDeque<(&'static str, serde_json::Value)>>,
    flushing: Mutex<()>,
}

impl EventQueue {
    pub fn new(bus: EventBusRef) -> Self {
        Self {
            bus,
            pending: Mutex::new(VecDeque::new()),
            flushing: Mutex::new(()),
        }
    }

    /// Record an event. Cheap enough to call under the producer's lock.
    pub fn push<T: Serialize>(&self, topic: &'static str, event: &T) {
        match serde_json::to_value(event) {
            Ok(payload) => self.pending().push_back((topic, payload)),
            Err(e) => tracing::warn!(topic, error = %e, "Failed to serialize event"),
        }
    }

    /// Emit everything recorded so far. Call with no producer lock held.
    pub fn flush(&self) {
        let flushing = match self.flushing.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            // The current flusher drains whatever we recorded.
            Err(TryLockError::WouldBlock) => return,
        };
        loop {
            let mut pending = self.pending();
            let Some((topic, payload)) = pending.pop_front() else {
                // Released while `pending` is held, so no push is left behind.
                drop(flushing);
                return;
            };
            drop(pending);
            self.bus.emit(topic, payload);
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<(&'static str, serde_json::Value)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory event bus for testing.
///
/// Captures all emitted events for later inspection.
#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<EmittedEvent>>,
}

/// A captured event from InMemoryEventBus.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured events.
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.lock().clone()
    }

    /// Get events for a specific topic.
    pub fn events_for(&self, topic: &str) -> Vec<EmittedEvent> {
        self.lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Most recent payload published on `topic`.
    pub fn last_for(&self, topic: &str) -> Option<serde_json::Value> {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.topic == topic)
            .map(|e| e.payload.clone())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EmittedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.lock().push(EmittedEvent {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// No-op event bus that discards all events.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _topic: &str, _payload: serde_json::Value) {}
}
