//! The event value type and its identifier, priority, bus, and status enums.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric event type tag. Kept as a transparent wrapper over `u32` rather
/// than a closed enum so embedders can register event types the core
/// doesn't know about; [`well_known`] lists the tags the classifier's
/// default table recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventType(pub u32);

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event type tags recognized by the classifier's default routing table
/// (spec §4.8: "Defaults cover the standard catalog").
pub mod well_known {
    use super::EventType;

    pub const PLUGIN_STARTED: EventType = EventType(100);
    pub const PLUGIN_STOPPED: EventType = EventType(101);
    pub const PLUGIN_FAILED: EventType = EventType(102);
    pub const HEALTH_CHECK: EventType = EventType(200);
    pub const CONFIG_CHANGED: EventType = EventType(300);
    pub const SECURITY_ALERT: EventType = EventType(400);
    pub const RESOURCE_EXHAUSTED: EventType = EventType(500);
    pub const SYSTEM_STARTED: EventType = EventType(600);
    pub const SYSTEM_UPGRADE: EventType = EventType(601);
    pub const SYSTEM_SHUTDOWN: EventType = EventType(602);
    pub const ERROR_OCCURRED: EventType = EventType(603);
    pub const METRICS_REPORTED: EventType = EventType(700);
}

/// Event priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// An isolation domain. Each `BusType` gets its own queue, workers,
/// metrics, and history (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    Plugin,
    System,
    Business,
    Health,
    Config,
    Resource,
    Security,
    Metrics,
}

impl BusType {
    pub const ALL: [BusType; 8] = [
        BusType::Plugin,
        BusType::System,
        BusType::Business,
        BusType::Health,
        BusType::Config,
        BusType::Resource,
        BusType::Security,
        BusType::Metrics,
    ];
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusType::Plugin => "plugin",
            BusType::System => "system",
            BusType::Business => "business",
            BusType::Health => "health",
            BusType::Config => "config",
            BusType::Resource => "resource",
            BusType::Security => "security",
            BusType::Metrics => "metrics",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle status carried on an event, observable by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Created,
    Published,
    Delivered,
    Failed,
    DeadLettered,
}

impl Default for EventStatus {
    fn default() -> Self {
        EventStatus::Created
    }
}

/// Metadata values may nest (spec §3), so we carry raw JSON rather than a
/// flat string map.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A stable identifier derived from `{plugin_id}-{type_tag}-{unix_sec}-{nanos}`.
/// Not a cryptographic hash: collisions are tolerable because this id is a
/// hint for dedup/tracing, not a correctness primitive (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EventId {
    fn new(plugin_id: &str, event_type: EventType, unix_sec: i64, nanos: u32) -> Self {
        EventId(format!("{plugin_id}-{}-{unix_sec}-{nanos}", event_type.0))
    }
}

/// An immutable descriptor of a single event. Once constructed, the core
/// never mutates a published event; builders return new values (spec §4.1).
/// Metadata is shared read-only after publish via `Arc` so cloning an
/// `Event` for fan-out delivery never copies the map (open question 1 in
/// spec §9, resolved: read-only sharing for general publish, deep copy only
/// on the DLQ path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub priority: Priority,
    pub source: String,
    pub category: String,
    pub plugin_id: String,
    pub status: EventStatus,
    pub error: Option<String>,
    pub metadata: Arc<Metadata>,
    /// Monotonic-suitable timestamp, unix seconds.
    pub timestamp: i64,
}

impl Event {
    /// Construct a new event stamped with the current time, given the
    /// minimal (type, plugin id, source) triple (spec §4.1).
    pub fn new(event_type: EventType, plugin_id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let plugin_id = plugin_id.into();
        let id = EventId::new(&plugin_id, event_type, now.as_secs() as i64, now.subsec_nanos());
        Event {
            id,
            event_type,
            priority: Priority::default(),
            source: source.into(),
            category: String::new(),
            plugin_id,
            status: EventStatus::default(),
            error: None,
            metadata: Arc::new(Metadata::new()),
            timestamp: now.as_secs() as i64,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Deep-copies the metadata map; used on the DLQ path where spec §4.7.4
    /// requires a snapshot independent of the original event's map.
    pub fn cloned_metadata(&self) -> Metadata {
        (*self.metadata).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_embeds_plugin_type_and_time() {
        let ev = Event::new(well_known::PLUGIN_STARTED, "p1", "test");
        assert!(ev.id.0.starts_with("p1-100-"));
    }

    #[test]
    fn builders_return_new_values() {
        let ev = Event::new(well_known::HEALTH_CHECK, "p1", "test");
        let ev2 = ev.clone().with_priority(Priority::Critical);
        assert_eq!(ev.priority, Priority::Normal);
        assert_eq!(ev2.priority, Priority::Critical);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn dlq_metadata_is_deep_copied() {
        let mut meta = Metadata::new();
        meta.insert("k".into(), serde_json::json!("v"));
        let ev = Event::new(well_known::ERROR_OCCURRED, "p1", "test").with_metadata(meta);
        let copy = ev.cloned_metadata();
        assert_eq!(copy.get("k"), ev.metadata.get("k"));
        assert!(!std::ptr::eq(&copy, &*ev.metadata as *const _ as *const Metadata));
    }
}
