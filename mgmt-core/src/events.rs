//! Event broadcast for task transitions and session changes.
//!
//! Subscribers receive JSON lines of the form
//! `{"event": ..., "data": ..., "timestamp": <RFC 3339>}`.

use chrono::Utc;
use mgmt_common::{ClusterId, TaskId, TaskStatus};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

pub const EVENT_TASK_TRANSITION: &str = "task_transition";
pub const EVENT_TASK_ANOMALY: &str = "task_anomaly";
pub const EVENT_SUSPENDED: &str = "cluster_suspended";
pub const EVENT_RESUMED: &str = "cluster_resumed";
pub const EVENT_SCENARIO: &str = "scenario_finished";

/// Observed status change of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Whether the change is reachable in the lifecycle state machine.
    pub legal: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspendEvent {
    pub cluster_id: ClusterId,
    pub stop_tasks: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub on_resume_start_tasks: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeEvent {
    pub cluster_id: ClusterId,
    pub start_tasks: bool,
}

impl SuspendEvent {
    pub fn new(cluster_id: ClusterId, stop_tasks: bool, duration: Option<Duration>, on_resume_start_tasks: bool) -> Self {
        Self {
            cluster_id,
            stop_tasks,
            duration_secs: duration.map(|d| d.as_secs()),
            on_resume_start_tasks,
        }
    }
}

/// Broadcast channel for harness events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// The effective buffer is at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event. Dropped silently when nobody listens.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!(event, error = %err, "Failed to serialize event"),
        }
    }
}

/// Drain everything currently buffered on a receiver.
pub fn drain(rx: &mut broadcast::Receiver<String>) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(line) => {
                if let Ok(value) = serde_json::from_str(&line) {
                    events.push(value);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_sends_json_with_event_data_and_timestamp() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(
            EVENT_TASK_TRANSITION,
            &TransitionEvent {
                task_id: TaskId::new("repair/1"),
                from: TaskStatus::Running,
                to: TaskStatus::Stopped,
                legal: true,
            },
        );

        let msg = rx.recv().await.expect("broadcast recv failed");
        let parsed: serde_json::Value = serde_json::from_str(&msg).expect("invalid json");
        assert_eq!(parsed["event"], "task_transition");
        assert_eq!(parsed["data"]["to"], "STOPPED");
        let ts = parsed["timestamp"].as_str().expect("timestamp should be string");
        chrono::DateTime::parse_from_rfc3339(ts).expect("timestamp should be RFC3339");
    }

    #[test]
    fn small_buffers_are_clamped() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        for idx in 0..DEFAULT_BUFFER {
            bus.emit("n", &idx);
        }
        assert_eq!(drain(&mut rx).len(), DEFAULT_BUFFER);
    }

    #[test]
    fn suspend_event_omits_missing_duration() {
        let event = SuspendEvent::new(ClusterId::new("c1"), true, None, false);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("duration_secs"));
        let timed = SuspendEvent::new(ClusterId::new("c1"), true, Some(Duration::from_secs(90)), true);
        assert!(serde_json::to_string(&timed).unwrap().contains("\"duration_secs\":90"));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::default().emit("nobody", &1);
    }
}
