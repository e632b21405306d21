//! Event bus interface
//!
//! Inbound domain events trigger sagas; outbound commands carry side effects,
//! notifications and escalations to the backoffice layer. Delivery is
//! at-least-once and fire-and-forget, so every outbound command carries an
//! idempotency key consumers use to de-duplicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A domain event, either received from outside or emitted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// The caller-supplied key, or one derived from the event content.
    pub fn effective_idempotency_key(&self) -> String {
        match &self.idempotency_key {
            Some(key) => key.clone(),
            None => idempotency_key("event", &self.event_type, 0, &self.payload),
        }
    }
}

/// A declarative `{action, input}` command for the external command bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub action: String,
    pub input: Value,
    pub idempotency_key: String,
    pub emitted_at: DateTime<Utc>,
}

impl OutboundCommand {
    pub fn new(
        action: impl Into<String>,
        input: Value,
        idempotency_key: impl Into<String>,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action: action.into(),
            input,
            idempotency_key: idempotency_key.into(),
            emitted_at,
        }
    }
}

/// Deterministic key of the form `entityType:entityId:version:hash`.
///
/// The hash is a name-based UUID over the canonical JSON of `payload`, so the
/// same logical operation always produces the same key.
pub fn idempotency_key(entity_type: &str, entity_id: &str, version: u64, payload: &Value) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, &canonical);
    format!("{entity_type}:{entity_id}:{version}:{}", hash.simple())
}

/// Publishing side of the bus. Both operations must not block the caller.
pub trait EventBus: Send + Sync {
    fn publish_event(&self, event: DomainEvent);
    fn dispatch(&self, command: OutboundCommand);
}

/// Receiving halves of a [`ChannelBus`].
#[derive(Debug)]
pub struct BusReceivers {
    pub events: mpsc::UnboundedReceiver<DomainEvent>,
    pub commands: mpsc::UnboundedReceiver<OutboundCommand>,
}

/// In-process bus backed by unbounded channels.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    events: mpsc::UnboundedSender<DomainEvent>,
    commands: mpsc::UnboundedSender<OutboundCommand>,
}

impl ChannelBus {
    pub fn new() -> (Self, BusReceivers) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                events: events_tx,
                commands: commands_tx,
            },
            BusReceivers {
                events: events_rx,
                commands: commands_rx,
            },
        )
    }
}

impl EventBus for ChannelBus {
    fn publish_event(&self, event: DomainEvent) {
        debug!(event_type = %event.event_type, "Publishing domain event");
        if let Err(e) = self.events.send(event) {
            warn!(event_type = %e.0.event_type, "Event bus closed, dropping domain event");
        }
    }

    fn dispatch(&self, command: OutboundCommand) {
        debug!(
            action = %command.action,
            idempotency_key = %command.idempotency_key,
            "Dispatching outbound command"
        );
        if let Err(e) = self.commands.send(command) {
            warn!(action = %e.0.action, "Command bus closed, dropping outbound command");
        }
    }
}

/// Bus that keeps everything it sees, for assertions and dry runs.
#[derive(Debug, Default)]
pub struct RecordingBus {
    events: Mutex<Vec<DomainEvent>>,
    commands: Mutex<Vec<OutboundCommand>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn commands(&self) -> Vec<OutboundCommand> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Commands whose action matches `action`.
    pub fn commands_for(&self, action: &str) -> Vec<OutboundCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.action == action)
            .collect()
    }

    pub fn events_of(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl EventBus for RecordingBus {
    fn publish_event(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn dispatch(&self, command: OutboundCommand) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command);
    }
}
