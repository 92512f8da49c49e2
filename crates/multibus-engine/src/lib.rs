//! The running multi-bus event engine: object pools, history, metrics,
//! throttling, the per-bus state machine, the classifier, the manager,
//! listener registry, and the plugin-adapter boundary.
//!
//! `multibus-core` defines the value types this crate schedules and
//! delivers; nothing here is a public contract an embedder serializes —
//! that boundary is the core crate.

pub mod adapter;
pub mod bus;
pub mod classifier;
pub mod handler;
pub mod history;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod throttle;
pub mod telemetry;

pub use adapter::{Adapter, ExternalEvent};
pub use bus::{Bus, BusStatus, CancelHandle};
pub use classifier::Classifier;
pub use handler::{FnHandler, Handler};
pub use history::History;
pub use listener::ListenerRegistry;
pub use manager::{close_global, global, Manager};
pub use metrics::{BusMetricsSnapshot, Monitor, MonitorSnapshot, GLOBAL_MONITOR};
pub use telemetry::{init_logging, TracingLogger};
