//! Progression events
//!
//! Mutations (a quiz submitted, an activity completed, a usage flush) are
//! published on a broadcast [`EventBus`]. Consumers never patch cached data
//! from an event; they drop the affected entries and refetch.
//!
//! Consumers:
//! - cache invalidation ([`crate::cache::spawn_invalidation_listener`])
//! - audit logging ([`spawn_logging_listener`])

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::HistoryKey;
use crate::usage::UsageKey;

/// Default number of events a slow subscriber may fall behind by
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ProgressionEvent {
    QuizSubmitted {
        key: HistoryKey,
        attempt_number: u32,
    },
    RevisionCompleted {
        key: HistoryKey,
        revision_number: u32,
    },
    ActivityCompleted {
        plan_id: String,
        activity_id: String,
    },
    /// Activities were moved between sessions
    PlanRebalanced {
        plan_id: String,
    },
    UsageFlushed {
        key: UsageKey,
        flush_id: String,
        seconds: u64,
        total: u64,
    },
    UsageFlushFailed {
        key: UsageKey,
        flush_id: String,
        seconds: u64,
        error: String,
    },
}

/// Synchronous event consumer driven by [`spawn_listener`]
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProgressionEvent);

    /// Called when the subscriber fell behind and `skipped` events were lost
    fn on_lagged(&self, skipped: u64) {
        warn!(skipped = skipped, "Event listener lagged");
    }
}

/// Broadcast channel for progression events
pub struct EventBus {
    sender: broadcast::Sender<ProgressionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns how many subscribers will see it.
    pub fn emit(&self, event: ProgressionEvent) -> usize {
        trace!(event = ?event, "Emitting progression event");
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed every event on the bus to `listener` until the bus is dropped
pub fn spawn_listener(event_bus: &EventBus, listener: Arc<dyn EventListener>) -> JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => listener.on_lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, listener exiting");
                    break;
                }
            }
        }
    })
}

/// Writes progression events to the log as an audit trail
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ProgressionEvent) {
        match event {
            ProgressionEvent::QuizSubmitted {
                key,
                attempt_number,
            } => {
                info!(key = %key, attempt = attempt_number, "Quiz submitted");
            }
            ProgressionEvent::RevisionCompleted {
                key,
                revision_number,
            } => {
                info!(key = %key, revision = revision_number, "Revision completed");
            }
            ProgressionEvent::ActivityCompleted {
                plan_id,
                activity_id,
            } => {
                info!(plan_id = %plan_id, activity_id = %activity_id, "Activity completed");
            }
            ProgressionEvent::PlanRebalanced { plan_id } => {
                info!(plan_id = %plan_id, "Plan rebalanced");
            }
            ProgressionEvent::UsageFlushed {
                key,
                seconds,
                total,
                ..
            } => {
                debug!(key = %key, seconds = seconds, total = total, "Usage flushed");
            }
            ProgressionEvent::UsageFlushFailed {
                key,
                flush_id,
                seconds,
                error,
            } => {
                warn!(key = %key, flush_id = %flush_id, seconds = seconds, error = %error, "Usage flush failed");
            }
        }
    }

    fn on_lagged(&self, skipped: u64) {
        debug!(skipped = skipped, "Audit log skipped events");
    }
}

pub fn spawn_logging_listener(event_bus: &EventBus) -> JoinHandle<()> {
    spawn_listener(event_bus, Arc::new(LoggingEventListener))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records activity ids it sees
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &ProgressionEvent) {
            if let ProgressionEvent::ActivityCompleted { activity_id, .. } = event {
                self.seen.lock().unwrap().push(activity_id.clone());
            }
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let delivered = bus.emit(ProgressionEvent::PlanRebalanced {
            plan_id: "plan-7".into(),
        });
        assert_eq!(delivered, 1);

        let event = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ProgressionEvent::PlanRebalanced { ref plan_id } if plan_id == "plan-7"
        ));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::with_capacity(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.emit(ProgressionEvent::ActivityCompleted {
                plan_id: "p".into(),
                activity_id: "a".into(),
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_spawned_listener_sees_events_in_order() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_listener(&bus, recorder.clone());

        for id in ["a1", "a2", "a3"] {
            bus.emit(ProgressionEvent::ActivityCompleted {
                plan_id: "p".into(),
                activity_id: id.into(),
            });
        }
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a1", "a2", "a3"]);
    }
}
