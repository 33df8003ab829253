//! In-process event bus for UI push channels.
//!
//! Components publish typed [`Event`]s; the bus serializes each event to a
//! JSON line once and fans it out to every subscriber over a bounded
//! channel. A subscriber that cannot keep up (full queue) or has gone away
//! (closed channel) is dropped so a slow SSE client can never stall a
//! publisher.
//!
//! Delivery is in publish order per publisher; there is no replay. New
//! subscribers are expected to reconcile by polling the authoritative
//! stores after subscribing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ContainerState, RuntimeReadiness};

/// Closed set of domain events pushed to UI subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A notification the desktop shell should surface natively.
    OsNotification {
        title: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_slug: Option<String>,
    },
    /// A session began producing activity.
    SessionActive {
        agent_slug: String,
        session_id: String,
    },
    /// A session went quiet.
    SessionIdle {
        agent_slug: String,
        session_id: String,
    },
    /// A session failed.
    SessionError {
        agent_slug: String,
        session_id: String,
        message: String,
    },
    /// Container lifecycle state changed for an agent.
    AgentStatusChanged {
        agent_slug: String,
        status: ContainerState,
    },
    /// Health-monitor warnings changed for an agent.
    ContainerHealthChanged {
        agent_slug: String,
        warnings: Vec<String>,
    },
    /// A scheduled task was created.
    ScheduledTaskCreated {
        task_id: String,
        agent_slug: String,
    },
    /// The runtime/image readiness state machine transitioned.
    RuntimeReadinessChanged { readiness: RuntimeReadiness },
    /// A host browser became active or inactive for an agent.
    BrowserActive {
        agent_id: String,
        active: bool,
    },
    /// Heartbeat.
    Ping,
}

/// Default queue depth per subscriber.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Receiving half of a bus subscription.
///
/// Yields pre-serialized JSON lines; the SSE endpoint writes them verbatim.
pub type EventReceiver = mpsc::Receiver<Arc<str>>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<str>>,
}

/// Publish-subscribe fan-out for [`Event`]s.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscription ends when the returned receiver is dropped; the
    /// next publish after that prunes the dead entry.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, tx });
        rx
    }

    /// Serialize `event` once and deliver it to every live subscriber.
    ///
    /// Subscribers with a full or closed queue are dropped.
    pub fn publish(&self, event: Event) {
        let line: Arc<str> = match serde_json::to_string(&event) {
            Ok(json) => Arc::from(json.as_str()),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                return;
            }
        };

        let mut dropped: Vec<u64> = Vec::new();
        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|sub| match sub.tx.try_send(line.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.push(sub.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        for id in dropped {
            tracing::warn!(subscriber = id, "dropping slow event subscriber");
        }
    }

    /// Number of live subscribers (best effort; used by tests and shutdown).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscriber, ending their streams.
    pub fn close_all(&self) {
        self.subscribers.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
