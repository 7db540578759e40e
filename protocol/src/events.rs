//! Host events consumed by the automation engine.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;
use strum_macros::EnumString;

/// Event types the engine can subscribe automations to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    IntakeCreated,
    KbChanged,
    GapFlagRaised,
    DeadlineApproaching,
}

/// An event as delivered by the host (watcher, intake listener, store
/// triggers). `data` carries event-type-specific fields; the engine projects
/// a whitelisted subset into the dedupe payload.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DomainEvent {
    pub event_type: EventType,
    pub domain_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub data: JsonValue,
}
