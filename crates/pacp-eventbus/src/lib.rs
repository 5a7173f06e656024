//! Event Bus: a `tokio::sync::broadcast` channel of `PlaneEvent`s, fed by
//! the Store/Scheduler/Sync Engine and drained by SSE subscribers in
//! `pacp-daemon`/`pacp-activity`. Grounded directly on
//! `mqk-daemon::state::{BusMsg, AppState::bus}`.
//!
//! `tokio::broadcast` already gives us the drop-newest-with-warning
//! backpressure spec §4.4 asks for: a subscriber that falls behind the
//! fixed-capacity ring buffer gets `RecvError::Lagged(n)` on its next
//! poll instead of blocking the publisher, which `subscribe_stream`
//! below turns into a logged skip rather than a stream error.

use chrono::{DateTime, Utc};
use pacp_schemas::{Operation, SyncJob};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Externally-tagged event shape published on the bus (spec §4.4/§6's SSE
/// payloads), matching `BusMsg`'s `#[serde(tag = "type", ...)]` style.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaneEvent {
    OperationCreated { operation: Operation },
    OperationUpdated { operation: Operation },
    SyncJobCreated { sync_job: SyncJob },
    SyncJobUpdated { sync_job: SyncJob },
    Heartbeat { ts: DateTime<Utc> },
}

impl PlaneEvent {
    /// The SSE `event:` field name, distinct from the JSON `type` tag so
    /// clients can filter at the transport layer without parsing the body.
    pub fn event_name(&self) -> &'static str {
        match self {
            PlaneEvent::OperationCreated { .. } => "operation_created",
            PlaneEvent::OperationUpdated { .. } => "operation_updated",
            PlaneEvent::SyncJobCreated { .. } => "sync_job_created",
            PlaneEvent::SyncJobUpdated { .. } => "sync_job_updated",
            PlaneEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlaneEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every current subscriber. No-op (and not an error) if
    /// nobody is listening — matching `broadcast::Sender::send`'s own
    /// semantics of only failing when the channel has zero receivers.
    pub fn publish(&self, event: PlaneEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaneEvent> {
        self.tx.subscribe()
    }

    /// A `Stream<Item = PlaneEvent>` that silently skips lagged gaps,
    /// logging a warning instead of surfacing `RecvError::Lagged` to the
    /// caller — the SSE adapter in `pacp-daemon` wraps this directly.
    pub fn subscribe_stream(&self) -> impl Stream<Item = PlaneEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "eventbus/subscriber-lagged");
                None
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacp_schemas::{Operation, OperationStatus, OperationType, Priority};

    fn sample_operation() -> Operation {
        Operation {
            id: "op_test".into(),
            operation_type: OperationType::SafeProvision,
            priority: Priority::Normal,
            status: OperationStatus::Pending,
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_by: None,
            upstream_instance_id: None,
            correlation_id: None,
            claimed_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(PlaneEvent::OperationCreated { operation: sample_operation() });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_name(), "operation_created");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(PlaneEvent::Heartbeat { ts: Utc::now() });
    }

    #[tokio::test]
    async fn lagged_subscriber_stream_skips_instead_of_erroring() {
        let bus = EventBus::with_capacity(2);
        let stream = bus.subscribe_stream();
        tokio::pin!(stream);

        for _ in 0..5 {
            bus.publish(PlaneEvent::Heartbeat { ts: Utc::now() });
        }

        // The stream must still yield something rather than panicking or
        // terminating on the lag.
        let next = tokio::time::timeout(std::time::Duration::from_millis(100), stream.next())
            .await
            .expect("stream did not time out");
        assert!(next.is_some());
    }
}
