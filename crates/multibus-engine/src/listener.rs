//! Named, filter-guarded listeners with lifetime bound to a cancellation
//! token (spec §4.10).

use crate::bus::CancelHandle;
use crate::handler::Handler;
use crate::manager::Manager;
use multibus_core::{BusType, EventError, Filter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Listener {
    active: Arc<AtomicBool>,
    cancel: CancelHandle,
}

/// Registers named listeners against a [`Manager`], composing the
/// underlying per-type or bus-level cancel handles behind one id (spec
/// §4.10).
pub struct ListenerRegistry {
    manager: Arc<Manager>,
    listeners: RwLock<HashMap<String, Listener>>,
}

impl ListenerRegistry {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes per-type when the filter names types (the cheaper path,
    /// spec §4.2), otherwise takes one bus-level subscription. `Bus`
    /// itself expands a multi-type filter into one composed handle, so
    /// this never re-triggers that expansion. Duplicate ids are rejected
    /// (spec §4.10).
    pub fn add_listener(
        &self,
        id: impl Into<String>,
        filter: Filter,
        handler: Arc<dyn Handler>,
        bus: BusType,
    ) -> Result<(), EventError> {
        let id = id.into();
        {
            let listeners = self.listeners.read();
            if listeners.contains_key(&id) {
                return Err(EventError::SubscriptionDuplicate { id });
            }
        }

        let active = Arc::new(AtomicBool::new(true));
        let cancel = self.manager.subscribe_with_filter(bus, filter, handler);

        self.listeners.write().insert(id, Listener { active, cancel });
        Ok(())
    }

    /// Detaches a task that removes the listener once `token` is
    /// cancelled (spec §4.10: "detaches a goroutine that awaits ctx
    /// cancellation").
    pub fn add_listener_with_context(
        self: &Arc<Self>,
        id: impl Into<String>,
        filter: Filter,
        handler: Arc<dyn Handler>,
        bus: BusType,
        token: CancellationToken,
    ) -> Result<(), EventError> {
        let id = id.into();
        self.add_listener(id.clone(), filter, handler, bus)?;
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            token.cancelled().await;
            let _ = registry.remove_listener(&id);
        });
        Ok(())
    }

    /// Cancels every underlying subscription and clears the active flag
    /// so in-flight dispatches become no-ops (spec §4.10).
    pub fn remove_listener(&self, id: &str) -> Result<(), EventError> {
        let removed = self.listeners.write().remove(id);
        match removed {
            Some(listener) => {
                listener.active.store(false, Ordering::SeqCst);
                listener.cancel.cancel();
                Ok(())
            }
            None => Err(EventError::SubscriptionUnknown { id: id.to_string() }),
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.listeners.read().get(id).map(|l| l.active.load(Ordering::Relaxed)).unwrap_or(false)
    }

    pub fn list_listeners(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn clear(&self) {
        let ids: Vec<String> = self.list_listeners();
        for id in ids {
            let _ = self.remove_listener(&id);
        }
    }
}
