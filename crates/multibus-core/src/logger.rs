//! The minimal logging capability the core consumes (spec §1): a thin seam
//! so an embedding plugin manager can observe bus activity without pulling
//! in `tracing` if it doesn't already depend on it. `multibus-engine`'s
//! default `Logger` wraps `tracing`; this trait is what that adapter boundary
//! is built against.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]);
}

/// A `Logger` that discards everything; useful as a default in tests and
/// for embedders that don't want any logging overhead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _message: &str, _fields: &[(&str, &str)]) {}
}
