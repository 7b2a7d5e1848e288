//! Registry change notifications
//!
//! Projection layers (e.g. an API surface derived from registered schemas)
//! subscribe here and rebuild when the set of schemas changes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::identity::SchemaIdentity;

/// Capacity of the broadcast buffer; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A successful registry mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered { identity: SchemaIdentity },
    Evolved { identity: SchemaIdentity },
    Removed { identity: SchemaIdentity },
}

impl RegistryEvent {
    pub fn identity(&self) -> &SchemaIdentity {
        match self {
            RegistryEvent::Registered { identity }
            | RegistryEvent::Evolved { identity }
            | RegistryEvent::Removed { identity } => identity,
        }
    }
}

/// Publishing side of the registry event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error
    pub fn publish(&self, event: RegistryEvent) {
        let identity = event.identity().clone();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published event for {} to {} subscribers", identity, receivers),
            Err(_) => debug!("No subscribers for event on {}", identity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
