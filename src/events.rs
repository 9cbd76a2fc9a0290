use serde::Serialize;
use tokio::sync::broadcast;

use crate::executor::ExecutionState;
use crate::process::OutputStream;

/// Events published to whoever renders execution status (usually a UI).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum EngineEvent {
    #[serde(rename = "execution:started")]
    ExecutionStarted {
        execution_id: String,
        capability_id: String,
        dry_run: bool,
    },

    #[serde(rename = "execution:state")]
    StateChanged {
        execution_id: String,
        state: ExecutionState,
    },

    #[serde(rename = "execution:output")]
    Output {
        execution_id: String,
        stream: OutputStream,
        text: String,
    },

    #[serde(rename = "execution:finished")]
    ExecutionFinished {
        execution_id: String,
        capability_id: String,
        state: ExecutionState,
        success: bool,
        record_id: Option<String>,
    },

    #[serde(rename = "audit:warning")]
    AuditWarning {
        execution_id: String,
        message: String,
    },

    /// A consent-gated elevation is waiting for `respond()`.
    #[serde(rename = "elevation:prompt")]
    ElevationPrompt {
        request_id: String,
        execution_id: String,
        capability_id: String,
        capability_title: String,
        command: String,
    },
}

/// Broadcast fan-out. Emitting with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::StateChanged {
            execution_id: "e1".into(),
            state: ExecutionState::Dispatched,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::StateChanged { execution_id, state } => {
                assert_eq!(execution_id, "e1");
                assert_eq!(state, ExecutionState::Dispatched);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::default().emit(EngineEvent::AuditWarning {
            execution_id: "e1".into(),
            message: "disk full".into(),
        });
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(EngineEvent::Output {
            execution_id: "e1".into(),
            stream: OutputStream::Stderr,
            text: "oops".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "execution:output");
        assert_eq!(json["stream"], "stderr");
    }
}
