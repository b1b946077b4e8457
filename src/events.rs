#![forbid(unsafe_code)]

use crate::domain::HealthStatus;
use crate::flow::execution::{ExecutionStatus, StepStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Engine-emitted observability events. Consumers subscribe best-effort: the
/// engine never waits for them, and a lagging subscriber loses the oldest
/// events (counted, not back-pressured).
#[derive(Clone, Debug)]
pub enum EngineEvent {
    HealthChanged {
        endpoint: String,
        previous: HealthStatus,
        current: HealthStatus,
    },
    RouteDecision {
        route: String,
        rule: Option<String>,
        destinations: Vec<String>,
    },
    TransformationResult {
        transformation: String,
        success: bool,
        duration_ms: u64,
    },
    StepCompleted {
        flow: String,
        execution: Uuid,
        step: String,
        status: StepStatus,
        attempt: u32,
    },
    FlowCompleted {
        flow: String,
        execution: Uuid,
        status: ExecutionStatus,
    },
    DeadLetter {
        route: String,
        endpoint: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::HealthChanged { .. } => "health_changed",
            EngineEvent::RouteDecision { .. } => "route_decision",
            EngineEvent::TransformationResult { .. } => "transformation_result",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::FlowCompleted { .. } => "flow_completed",
            EngineEvent::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Append-only fan-out channel for [`EngineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes without blocking. Events published with no subscriber are
    /// intentionally discarded (monitoring is optional).
    pub fn publish(&self, event: EngineEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn snapshot(&self) -> EventBusSnapshot {
        EventBusSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventBusSnapshot {
    pub published: u64,
    pub dropped: u64,
}

/// Subscriber handle. `recv` skips over lagged gaps, accounting for the loss
/// instead of surfacing an error to the consumer loop.
pub struct EventStream {
    receiver: broadcast::Receiver<EngineEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_never_blocks_without_subscribers() {
        let bus = EventBus::new(4);
        for _ in 0..100 {
            bus.publish(EngineEvent::DeadLetter {
                route: "r".into(),
                endpoint: "dlq".into(),
                reason: "test".into(),
            });
        }
        assert_eq!(bus.snapshot().published, 100);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();

        for index in 0..5u64 {
            bus.publish(EngineEvent::RouteDecision {
                route: format!("r{index}"),
                rule: None,
                destinations: Vec::new(),
            });
        }

        // Buffer of 2 keeps only the newest two events.
        let first = stream.recv().await.expect("event");
        match first {
            EngineEvent::RouteDecision { route, .. } => assert_eq!(route, "r3"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bus.snapshot().dropped, 3);
    }
}
