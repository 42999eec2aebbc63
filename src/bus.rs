//! Process-wide event bus.
//!
//! Every adapter publishes onto one shared broadcast channel and any number
//! of consumers (HTTP handlers, tests, future push transports) subscribe.
//! Delivery is in-order per publisher, fan-out only, no persistence; a
//! lagging subscriber loses the oldest events (broadcast semantics).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lagging kicks in.
const BUS_CAPACITY: usize = 256;

/// Normalized event published by every player zone.
///
/// All zones share one topic; `stream_id` identifies the originating zone
/// and always matches exactly one configured player. `label` is either the
/// synthesized connection label (`event:online`) or `event:` followed by
/// the verbatim engine event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerEvent {
    /// Originating zone identifier
    pub stream_id: String,

    /// `event:online` or `event:<engine label>`
    pub label: String,

    /// Payload placeholder, currently always an empty object
    pub data: Value,
}

impl PlayerEvent {
    /// Event synthesized once per connection when a zone comes online.
    pub fn online(stream_id: impl Into<String>) -> Self {
        Self::new(stream_id, "online")
    }

    /// Event republished for an unsolicited engine event.
    pub fn new(stream_id: impl Into<String>, engine_label: &str) -> Self {
        Self {
            stream_id: stream_id.into(),
            label: format!("event:{engine_label}"),
            data: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Events flowing over the shared bus, one variant per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Shared zone topic: all players publish here, disambiguated by
    /// `stream_id` inside the payload.
    Player(PlayerEvent),

    /// Fixed routing-daemon topic: the raw JSON-RPC envelope as received.
    Snapcast(Value),
}

impl BusEvent {
    /// Event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Player(_) => "player",
            Self::Snapcast(_) => "snapcast",
        }
    }
}

/// The bus handle shared by all publishers and subscribers.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

pub type SharedBus = Arc<EventBus>;

/// Create the process-wide bus.
pub fn create_bus() -> SharedBus {
    let (tx, _) = broadcast::channel(BUS_CAPACITY);
    Arc::new(EventBus { tx })
}

impl EventBus {
    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is
    /// simply dropped.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
