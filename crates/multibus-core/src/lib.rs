//! Value types and contracts for the multibus event system.
//!
//! This crate holds the stable surface the engine is built against: the
//! [`Event`] value type and its identifiers, the [`Filter`] predicate, the
//! per-bus [`config::BusConfig`], the [`error::EventError`] taxonomy, and the
//! minimal [`logger::Logger`] capability. It has no opinion on scheduling,
//! queues, or retries — that belongs to `multibus-engine`.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod logger;

pub use config::{BusConfig, DegradationMode, DropPolicy, MultibusSettings};
pub use error::EventError;
pub use event::{well_known, BusType, Event, EventId, EventStatus, EventType, Metadata, Priority};
pub use filter::Filter;
pub use logger::{LogLevel, Logger, NullLogger};
