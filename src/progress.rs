//! Live scan event fan-out to push subscribers

use crate::models::{
    deserialize_systemtime, serialize_systemtime, ScanId, ScanProgress,
};
use crate::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Events pushed to subscribers. Serialized as `{"type": ..., "scan_id": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    Connected {
        message: String,
        #[serde(serialize_with = "serialize_systemtime", deserialize_with = "deserialize_systemtime")]
        timestamp: SystemTime,
    },
    ScanStarted {
        scan_id: ScanId,
        name: String,
        paths: Vec<PathBuf>,
        algorithms: Vec<HashAlgorithm>,
    },
    ScanProgress {
        scan_id: ScanId,
        progress: ScanProgress,
    },
    ScanCompleted {
        scan_id: ScanId,
        files_processed: u64,
        duplicate_groups: usize,
        space_wasted: u64,
    },
    ScanFailed {
        scan_id: ScanId,
        error: String,
    },
    ScanCancelled {
        scan_id: ScanId,
        files_processed: u64,
    },
}

impl ScanEvent {
    pub fn connected() -> Self {
        ScanEvent::Connected {
            message: "Connected to scan progress stream".to_string(),
            timestamp: SystemTime::now(),
        }
    }

    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::Connected { .. } => "connected",
            ScanEvent::ScanStarted { .. } => "scan_started",
            ScanEvent::ScanProgress { .. } => "scan_progress",
            ScanEvent::ScanCompleted { .. } => "scan_completed",
            ScanEvent::ScanFailed { .. } => "scan_failed",
            ScanEvent::ScanCancelled { .. } => "scan_cancelled",
        }
    }

    pub fn scan_id(&self) -> Option<ScanId> {
        match self {
            ScanEvent::Connected { .. } => None,
            ScanEvent::ScanStarted { scan_id, .. }
            | ScanEvent::ScanProgress { scan_id, .. }
            | ScanEvent::ScanCompleted { scan_id, .. }
            | ScanEvent::ScanFailed { scan_id, .. }
            | ScanEvent::ScanCancelled { scan_id, .. } => Some(*scan_id),
        }
    }
}

/// A subscriber could not accept an event
#[derive(Debug, Error)]
#[error("event delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Anything that accepts a serialized event and may fail
pub trait EventSink: Send + Sync {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError>;
}

impl EventSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.send(payload.to_string())
            .map_err(|_| DeliveryError("receiver closed".into()))
    }
}

/// A full bounded channel counts as a failed delivery
impl EventSink for mpsc::Sender<String> {
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.try_send(payload.to_string())
            .map_err(|err| DeliveryError(err.to_string()))
    }
}

pub type SubscriberId = u64;

/// Registry of push subscribers.
///
/// Delivery happens under the subscriber lock so concurrent broadcasts reach
/// each subscriber in the order they were issued. Sinks must not block.
#[derive(Default)]
pub struct ProgressHub {
    subscribers: Mutex<Vec<(SubscriberId, Arc<dyn EventSink>)>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink and return its handle
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock().push((id, sink));
        debug!(subscriber = id, "Subscriber registered");
        id
    }

    /// Register an in-process channel subscriber. The receiver sees a
    /// `connected` event addressed only to it before any broadcast.
    pub fn subscribe_channel(&self) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(welcome) = welcome_payload() {
            let _ = tx.send(welcome);
        }
        (self.subscribe(Arc::new(tx)), rx)
    }

    /// Like `subscribe_channel`, but holding at most `capacity` undelivered
    /// events. A subscriber that falls that far behind is dropped on the next
    /// broadcast.
    pub fn subscribe_bounded(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Some(welcome) = welcome_payload() {
            let _ = tx.try_send(welcome);
        }
        (self.subscribe(Arc::new(tx)), rx)
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscriber = id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every subscriber, dropping any whose delivery
    /// fails. Returns the number of successful deliveries.
    pub fn broadcast(&self, event: &ScanEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(event = event.event_type(), error = %err, "Failed to serialize scan event");
                return 0;
            }
        };

        let mut subscribers = self.lock();
        if subscribers.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        subscribers.retain(|(id, sink)| match sink.deliver(&payload) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(err) => {
                warn!(subscriber = *id, event = event.event_type(), error = %err, "Dropping subscriber after failed delivery");
                false
            }
        });
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriberId, Arc<dyn EventSink>)>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn welcome_payload() -> Option<String> {
    match serde_json::to_string(&ScanEvent::connected()) {
        Ok(welcome) => Some(welcome),
        Err(err) => {
            error!(error = %err, "Failed to serialize welcome event");
            None
        }
    }
}
