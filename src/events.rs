//! Lifecycle event bus. One event per completed pipeline stage, fanned out
//! to WebSocket subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    IncidentDetected {
        incident_id: Uuid,
    },
    DiagnosisCompleted {
        incident_id: Uuid,
        diagnosis_id: Uuid,
    },
    RemediationCompleted {
        incident_id: Uuid,
        remediation_id: Uuid,
    },
    ProvisionStarted {
        request_id: Uuid,
    },
    ProvisionComplete {
        request_id: Uuid,
        success: bool,
    },
}

/// Broadcast channel wrapper. Slow subscribers lag and drop, they never
/// block the pipeline.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // Err means no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
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
    async fn events_reach_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(LifecycleEvent::IncidentDetected { incident_id: id });
        match rx.recv().await.unwrap() {
            LifecycleEvent::IncidentDetected { incident_id } => assert_eq!(incident_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(LifecycleEvent::ProvisionComplete {
            request_id: Uuid::nil(),
            success: true,
        })
        .unwrap();
        assert_eq!(json["event"], "provision_complete");
        assert_eq!(json["success"], true);
    }
}
