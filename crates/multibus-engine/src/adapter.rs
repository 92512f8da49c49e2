//! Translates external plugin-system events to core events and back —
//! the single embedding boundary (spec §4.11).

use crate::bus::CancelHandle;
use crate::handler::Handler;
use crate::listener::ListenerRegistry;
use crate::manager::Manager;
use multibus_core::{BusType, Event, EventError, EventType, Filter};
use std::sync::Arc;

/// An external event shape the adapter knows how to translate, kept
/// deliberately minimal: callers outside this crate own their own richer
/// plugin-event types and map into this one at the boundary.
#[derive(Debug, Clone)]
pub struct ExternalEvent {
    pub type_tag: u32,
    pub plugin_id: String,
    pub source: String,
}

/// Single boundary between a plugin system and the bus network. Listener
/// registration through the adapter can be namespaced by plugin id (spec
/// §4.11: "the adapter injects the plugin id into the filter's plugin-id
/// allowlist").
pub struct Adapter {
    manager: Arc<Manager>,
    listeners: Arc<ListenerRegistry>,
}

impl Adapter {
    pub fn new(manager: Arc<Manager>) -> Self {
        let listeners = Arc::new(ListenerRegistry::new(Arc::clone(&manager)));
        Self { manager, listeners }
    }

    pub fn to_core_event(&self, external: ExternalEvent) -> Event {
        Event::new(EventType(external.type_tag), external.plugin_id, external.source)
    }

    pub fn to_external_event(&self, event: &Event) -> ExternalEvent {
        ExternalEvent {
            type_tag: event.event_type.0,
            plugin_id: event.plugin_id.clone(),
            source: event.source.clone(),
        }
    }

    pub async fn publish(&self, external: ExternalEvent) -> Result<(), EventError> {
        self.manager.publish(self.to_core_event(external)).await
    }

    /// Namespaces the filter by plugin id before registering, so a plugin
    /// only ever observes its own events through the adapter (spec
    /// §4.11).
    pub fn add_listener_for_plugin(
        &self,
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        mut filter: Filter,
        handler: Arc<dyn Handler>,
        bus: BusType,
    ) -> Result<(), EventError> {
        let plugin_id = plugin_id.into();
        if filter.plugin_ids.is_empty() {
            filter.plugin_ids = vec![plugin_id];
        } else if !filter.plugin_ids.contains(&plugin_id) {
            filter.plugin_ids.push(plugin_id);
        }
        self.listeners.add_listener(id, filter, handler, bus)
    }

    pub fn remove_listener(&self, id: &str) -> Result<(), EventError> {
        self.listeners.remove_listener(id)
    }

    pub fn subscribe(&self, bus: BusType, handler: Arc<dyn Handler>) -> CancelHandle {
        self.manager.subscribe(bus, handler)
    }

    /// Proxies history queries to the manager (spec §4.11: "History
    /// queries proxy to the manager").
    pub fn event_history(&self, filter: &Filter) -> Vec<Event> {
        self.manager.event_history(filter)
    }

    pub fn plugin_event_history(&self, plugin_id: &str) -> Vec<Event> {
        self.manager.plugin_event_history(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use multibus_core::NullLogger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn external_event_round_trips_through_core_event() {
        let manager = Manager::with_defaults(Arc::new(NullLogger));
        let adapter = Adapter::new(manager);
        let external = ExternalEvent { type_tag: 100, plugin_id: "p1".into(), source: "plugin-host".into() };
        let core_event = adapter.to_core_event(external.clone());
        let back = adapter.to_external_event(&core_event);
        assert_eq!(back.type_tag, external.type_tag);
        assert_eq!(back.plugin_id, external.plugin_id);
    }

    #[tokio::test]
    async fn listener_is_namespaced_by_plugin_id() {
        let manager = Manager::with_defaults(Arc::new(NullLogger));
        let adapter = Adapter::new(manager);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let handler: Arc<dyn Handler> = Arc::new(FnHandler::new(move |_ev| {
            let seen2 = Arc::clone(&seen2);
            async move {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        adapter
            .add_listener_for_plugin("L", "p1", Filter::new(), handler, BusType::Plugin)
            .unwrap();

        adapter.publish(ExternalEvent { type_tag: 100, plugin_id: "p1".into(), source: "host".into() }).await.unwrap();
        adapter.publish(ExternalEvent { type_tag: 100, plugin_id: "p2".into(), source: "host".into() }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
