//! Shared event contracts for the model manager and the chat session.
//!
//! Payload types live here so producers and observers agree on field
//! names. Also provides the `EventBus` trait for decoupled event emission.

mod bus;

pub use bus::{
    emit_event, EmittedEvent, EventBus, EventBusRef, EventQueue, InMemoryEventBus, NullEventBus,
};

use serde::{Deserialize, Serialize};

/// Snapshot of one model's download lifecycle.
///
/// Producers: models crate (asset manager)
/// Consumers: frontend, CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStateEvent {
    pub model_id: String,
    /// Lifecycle state name in snake case (e.g. "downloading").
    pub state: String,
    /// Files confirmed on disk.
    pub progress: usize,
    /// Files required by the model.
    pub total: usize,
}

/// User-visible notice (failed download, deleted model, rejected config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeEvent {
    #[serde(default)]
    pub model_id: Option<String>,
    pub message: String,
}

/// Emitted once the owner has forgotten a deleted model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRemovedEvent {
    pub model_id: String,
}

/// Snapshot of the chat session state.
///
/// Producers: session crate (controller)
/// Consumers: frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStateEvent {
    /// Session state name in snake case (e.g. "generating").
    pub state: String,
    /// Currently loaded model, if any.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Number of visible messages.
    pub message_count: usize,
}

/// Event names as constants to prevent typos.
pub mod event_names {
    pub const MODEL_STATE: &str = "models:state";
    pub const MODEL_NOTICE: &str = "models:notice";
    pub const MODEL_REMOVED: &str = "models:removed";
    pub const SESSION_STATE: &str = "session:state";
    /// Visible message list changed (append or in-place streaming update).
    pub const SESSION_MESSAGES: &str = "session:messages";
    pub const SESSION_NOTICE: &str = "session:notice";
}
