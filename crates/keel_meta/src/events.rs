//! Schema change notifications.
//!
//! After a batch commits, the applier's notify phase publishes one event per
//! changed object on a broadcast bus. Events carry names only; consumers
//! re-read whatever state they need. Delivery is best effort: a consumer
//! that falls behind sees a lag marker, not backpressure on the applier.

use tokio::sync::broadcast;

use crate::types::QualifiedName;

/// One schema change, emitted after the owning batch committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEvent {
    KeyspaceCreated { name: String },
    KeyspaceAltered { name: String },
    KeyspaceDropped { name: String },
    TableCreated { name: QualifiedName },
    TableAltered { name: QualifiedName },
    TableDropped { name: QualifiedName },
    ViewCreated { name: QualifiedName },
    ViewAltered { name: QualifiedName },
    ViewDropped { name: QualifiedName },
    TypeCreated { name: QualifiedName },
    TypeAltered { name: QualifiedName },
    TypeDropped { name: QualifiedName },
    FunctionCreated { name: QualifiedName },
    FunctionAltered { name: QualifiedName },
    FunctionDropped { name: QualifiedName },
    AggregateCreated { name: QualifiedName },
    AggregateAltered { name: QualifiedName },
    AggregateDropped { name: QualifiedName },
}

/// Broadcast bus for schema events.
pub struct SchemaEventBus {
    tx: broadcast::Sender<SchemaEvent>,
}

impl SchemaEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchemaEvent> {
        self.tx.subscribe()
    }

    /// Publish one event. A bus without subscribers drops it silently.
    pub fn emit(&self, event: SchemaEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("schema event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SchemaEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
