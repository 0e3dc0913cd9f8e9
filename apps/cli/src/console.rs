use mlchat_events::{event_names, EventBus, NoticeEvent};
use std::sync::Mutex;

/// Event bus that turns notices into log lines and remembers them, so a
/// command can explain why a model stopped making progress.
#[derive(Default)]
pub struct ConsoleBus {
    notices: Mutex<Vec<NoticeEvent>>,
}

impl ConsoleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest notice about `model_id`.
    pub fn last_notice(&self, model_id: &str) -> Option<String> {
        self.notices
            .lock()
            .expect("notice mutex poisoned")
            .iter()
            .rev()
            .find(|n| n.model_id.as_deref() == Some(model_id))
            .map(|n| n.message.clone())
    }

    pub fn notice_count(&self) -> usize {
        self.notices.lock().expect("notice mutex poisoned").len()
    }
}

impl EventBus for ConsoleBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        match topic {
            event_names::MODEL_NOTICE | event_names::SESSION_NOTICE => {
                match serde_json::from_value::<NoticeEvent>(payload) {
                    Ok(notice) => {
                        tracing::warn!(model_id = ?notice.model_id, "{}", notice.message);
                        self.notices
                            .lock()
                            .expect("notice mutex poisoned")
                            .push(notice);
                    }
                    Err(e) => tracing::debug!(topic, error = %e, "Malformed notice"),
                }
            }
            _ => tracing::trace!(topic, %payload, "Event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remembers_notices_per_model() {
        let bus = ConsoleBus::new();
        bus.emit(
            event_names::MODEL_NOTICE,
            json!({"model_id": "a", "message": "first"}),
        );
        bus.emit(
            event_names::MODEL_NOTICE,
            json!({"model_id": "b", "message": "other"}),
        );
        bus.emit(
            event_names::MODEL_NOTICE,
            json!({"model_id": "a", "message": "second"}),
        );
        bus.emit(event_names::MODEL_STATE, json!({"model_id": "a"}));

        assert_eq!(bus.last_notice("a").as_deref(), Some("second"));
        assert_eq!(bus.last_notice("c"), None);
        assert_eq!(bus.notice_count(), 3);
    }
}
