//! Pure routing table: which single bus an event lands on (spec §4.8).
//!
//! Classification never touches a queue or a lock shared with the hot
//! publish path — it's a plain lookup, cheap enough to run synchronously
//! inside `Bus::publish`/`Manager::dispatch`.

use multibus_core::{well_known, BusType, Event, EventType};
use std::collections::HashMap;

/// Builds the default event-type -> bus table (spec §4.8: "Defaults cover
/// the standard catalog"; Glossary: "Classifier — pure router mapping an
/// event to exactly one bus").
fn default_table() -> HashMap<EventType, BusType> {
    let mut table = HashMap::new();
    table.insert(well_known::PLUGIN_STARTED, BusType::Plugin);
    table.insert(well_known::PLUGIN_STOPPED, BusType::Plugin);
    table.insert(well_known::PLUGIN_FAILED, BusType::Plugin);
    table.insert(well_known::HEALTH_CHECK, BusType::Health);
    table.insert(well_known::CONFIG_CHANGED, BusType::Config);
    table.insert(well_known::SECURITY_ALERT, BusType::Security);
    table.insert(well_known::RESOURCE_EXHAUSTED, BusType::Resource);
    table.insert(well_known::SYSTEM_STARTED, BusType::System);
    table.insert(well_known::SYSTEM_UPGRADE, BusType::System);
    table.insert(well_known::SYSTEM_SHUTDOWN, BusType::System);
    table.insert(well_known::ERROR_OCCURRED, BusType::System);
    table.insert(well_known::METRICS_REPORTED, BusType::Metrics);
    table
}

/// Routes each event to exactly one bus, honoring per-plugin overrides
/// over the default table (spec §4.8).
pub struct Classifier {
    default_routes: HashMap<EventType, BusType>,
    plugin_overrides: HashMap<String, HashMap<EventType, BusType>>,
    fallback: BusType,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            default_routes: default_table(),
            plugin_overrides: HashMap::new(),
            fallback: BusType::Business,
        }
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a per-plugin override that takes priority over the
    /// default table for that plugin's events of the given type (spec
    /// §4.8: "plugin-specific overrides").
    pub fn set_override(&mut self, plugin_id: impl Into<String>, event_type: EventType, bus: BusType) {
        self.plugin_overrides
            .entry(plugin_id.into())
            .or_default()
            .insert(event_type, bus);
    }

    pub fn clear_override(&mut self, plugin_id: &str, event_type: EventType) {
        if let Some(overrides) = self.plugin_overrides.get_mut(plugin_id) {
            overrides.remove(&event_type);
        }
    }

    /// Events with no match in either table route to `Business` (spec
    /// §4.8: "unclassified events fall back to the business bus").
    pub fn classify(&self, event: &Event) -> BusType {
        if let Some(overrides) = self.plugin_overrides.get(&event.plugin_id) {
            if let Some(bus) = overrides.get(&event.event_type) {
                return *bus;
            }
        }
        self.classify_type(event.event_type)
    }

    /// Default-table lookup with no plugin context, for callers (like
    /// `Manager::subscribe_to`) that route by type alone.
    pub fn classify_type(&self, event_type: EventType) -> BusType {
        self.default_routes.get(&event_type).copied().unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(plugin: &str, ty: EventType) -> Event {
        Event::new(ty, plugin, "src")
    }

    #[test]
    fn default_table_routes_known_types() {
        let c = Classifier::new();
        assert_eq!(c.classify(&ev("p1", well_known::HEALTH_CHECK)), BusType::Health);
    }

    #[test]
    fn unknown_types_fall_back_to_business() {
        let c = Classifier::new();
        assert_eq!(c.classify(&ev("p1", EventType(99999))), BusType::Business);
    }

    #[test]
    fn plugin_override_takes_priority() {
        let mut c = Classifier::new();
        c.set_override("p1", well_known::HEALTH_CHECK, BusType::Security);
        assert_eq!(c.classify(&ev("p1", well_known::HEALTH_CHECK)), BusType::Security);
        assert_eq!(c.classify(&ev("p2", well_known::HEALTH_CHECK)), BusType::Health);
    }

    #[test]
    fn clearing_override_restores_default() {
        let mut c = Classifier::new();
        c.set_override("p1", well_known::HEALTH_CHECK, BusType::Security);
        c.clear_override("p1", well_known::HEALTH_CHECK);
        assert_eq!(c.classify(&ev("p1", well_known::HEALTH_CHECK)), BusType::Health);
    }
}
