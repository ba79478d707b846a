//! Append-only job event log with live fan-out. The durable write always
//! completes before the publish, so a subscriber that replays history and
//! then switches to the live channel never sees a gap; overlap is resolved
//! by de-duplicating on (run id, seq).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use super::store::Store;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RunStarted,
    AssistantDelta,
    ToolCall,
    ToolResult,
    Usage,
    AssistantMessage,
    Status,
    Error,
    RunFinished,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::AssistantDelta => "assistant_delta",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Usage => "usage",
            EventType::AssistantMessage => "assistant_message",
            EventType::Status => "status",
            EventType::Error => "error",
            EventType::RunFinished => "run_finished",
        }
    }
}

/// Wire shape shared by the replay read path and the live publish path, so a
/// single external decoder serves both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub run_id: String,
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: String,
    pub payload: serde_json::Value,
}

/// Per-job live broadcast channels.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, job_id: &str) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn publish(&self, envelope: &EventEnvelope) {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(&envelope.run_id) {
            let _ = tx.send(envelope.clone()); // Ignored if no receivers
        }
    }

    pub async fn remove(&self, job_id: &str) {
        self.channels.lock().await.remove(job_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventLog {
    store: Arc<Store>,
    bus: EventBus,
}

impl EventLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            bus: EventBus::new(),
        }
    }

    /// Assign the job's next sequence number, durably append, then publish.
    /// Returns the assigned sequence.
    pub async fn emit(
        &self,
        job_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let record = self
            .store
            .append_job_event(job_id, event_type.as_str(), &payload.to_string())
            .await?;
        let envelope = EventEnvelope {
            run_id: record.job_id,
            seq: record.seq,
            event_type: record.event_type,
            created_at: record.created_at,
            payload,
        };
        self.bus.publish(&envelope).await;
        Ok(envelope.seq)
    }

    /// Persisted history after a sequence watermark, in order.
    pub async fn replay(&self, job_id: &str, after_seq: i64) -> Result<Vec<EventEnvelope>> {
        let records = self.store.list_job_events(job_id, after_seq).await?;
        Ok(records
            .into_iter()
            .map(|r| EventEnvelope {
                run_id: r.job_id,
                seq: r.seq,
                event_type: r.event_type,
                payload: serde_json::from_str(&r.payload_json)
                    .unwrap_or(serde_json::Value::Null),
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn subscribe(&self, job_id: &str) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe(job_id).await
    }

    pub async fn close_channel(&self, job_id: &str) {
        self.bus.remove(job_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_log() -> EventLog {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("engine.db")).await.unwrap();
        // Keep the tempdir alive for the duration of the test by leaking it;
        // the OS cleans up the tmpfs entry.
        std::mem::forget(dir);
        EventLog::new(Arc::new(store))
    }

    #[tokio::test]
    async fn sequences_are_contiguous_from_one() {
        let log = test_log().await;
        for expected in 1..=5 {
            let seq = log
                .emit("job-1", EventType::AssistantDelta, serde_json::json!({"text": "x"}))
                .await
                .unwrap();
            assert_eq!(seq, expected);
        }
        let history = log.replay("job-1", 0).await.unwrap();
        let seqs: Vec<i64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn sequences_are_independent_per_job() {
        let log = test_log().await;
        log.emit("job-a", EventType::RunStarted, serde_json::json!({}))
            .await
            .unwrap();
        let seq = log
            .emit("job-b", EventType::RunStarted, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn live_subscriber_sees_published_envelope() {
        let log = test_log().await;
        let mut rx = log.subscribe("job-1").await;
        log.emit("job-1", EventType::Status, serde_json::json!({"status": "running"}))
            .await
            .unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.run_id, "job-1");
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.event_type, "status");
        assert_eq!(envelope.payload["status"], "running");
    }

    #[tokio::test]
    async fn replay_matches_live_shape() {
        let log = test_log().await;
        let mut rx = log.subscribe("job-1").await;
        log.emit("job-1", EventType::Usage, serde_json::json!({"total_tokens": 9}))
            .await
            .unwrap();
        let live = rx.recv().await.unwrap();
        let replayed = log.replay("job-1", 0).await.unwrap().remove(0);
        assert_eq!(
            serde_json::to_value(&live).unwrap(),
            serde_json::to_value(&replayed).unwrap()
        );
    }

    #[test]
    fn envelope_serializes_with_camel_case_keys() {
        let envelope = EventEnvelope {
            run_id: "job-1".to_string(),
            seq: 3,
            event_type: "tool_call".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            payload: serde_json::json!({"name": "file_inspect"}),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("runId").is_some());
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["type"], "tool_call");
    }
}
