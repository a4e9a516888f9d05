//! Per-replica event bus.
//!
//! Consumers (views) subscribe to a broadcast stream of replica events.
//! Lagging subscribers miss events rather than blocking the engine; a view
//! that needs lossless history reads the attribute map directly.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::value::Value;

/// An event observed on a replica.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// An attribute changed, locally or from a remote update.
    Changed {
        /// The attribute name.
        name: String,
        /// The new value.
        value: Value,
    },
    /// A one-shot custom message arrived from the kernel.
    Custom {
        /// The structured content of the message.
        content: serde_json::Value,
        /// Raw binary payloads carried alongside.
        buffers: Vec<Bytes>,
    },
    /// The reachability flag changed.
    LiveChanged {
        /// Whether the replica is now attached and reachable.
        live: bool,
    },
    /// The replica was closed; no further events follow.
    Closed,
}

/// Broadcast bus carrying [`ReplicaEvent`]s to any number of subscribers.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ReplicaEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub(crate) fn emit(&self, event: ReplicaEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}
