//! The single error surface callers see (spec §7): overload, retries, and
//! handler panics are absorbed internally and never reach this type.

use crate::event::{BusType, EventType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid configuration for bus {bus}: {reason}")]
    ConfigInvalid { bus: BusType, reason: String },

    #[error("no bus is registered for event type {event_type}")]
    RoutingFailure { event_type: EventType },

    #[error("listener id {id:?} is already registered")]
    SubscriptionDuplicate { id: String },

    #[error("listener id {id:?} is not registered")]
    SubscriptionUnknown { id: String },

    #[error("bus {bus} is closed")]
    Closed { bus: BusType },
}
