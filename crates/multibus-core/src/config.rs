//! Per-bus configuration and its defaults.

use crate::event::{BusType, Priority};
use crate::error::EventError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Admission-control behavior when a bus's queue is full (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropPolicy {
    DropNewest,
    DropOldest,
    Block,
}

/// Hysteretic overload response once `DegradationThreshold` is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradationMode {
    Drop,
    Pause,
    Throttle,
}

/// Recognized per-bus options (spec §3's `BusConfig` table). The error
/// callback is not part of this struct — it isn't a value the config can
/// round-trip through serde, so it's registered separately on the `Bus`
/// (see `multibus-engine::bus::Bus::set_error_callback`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: BusType,
    pub max_queue: usize,
    pub flush_interval: Duration,
    pub default_priority: Priority,

    pub enable_history: bool,
    pub history_size: usize,
    pub history_max_age: Option<Duration>,

    pub enable_metrics: bool,

    pub max_retries: u32,
    pub max_concurrent_retries: usize,

    pub batch_size: usize,
    pub worker_count: usize,

    pub enable_degradation: bool,
    pub degradation_threshold: u8,
    pub degradation_recover_threshold: u8,
    pub degradation_mode: DegradationMode,

    pub enable_throttling: bool,
    pub throttle_rate: f64,
    pub throttle_burst: u32,

    pub drop_policy: DropPolicy,
    pub enqueue_block_timeout: Duration,
    pub reserve_for_critical: usize,
}

impl BusConfig {
    /// Fails fast on values that would make the bus unable to run (spec §4.9
    /// / §7: "ConfigInvalid — surfaced at construction; non-recoverable").
    pub fn validate(&self) -> Result<(), EventError> {
        if self.max_queue == 0 {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "max_queue must be > 0".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "batch_size must be > 0".into(),
            });
        }
        if self.worker_count == 0 {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "worker_count must be > 0".into(),
            });
        }
        if self.reserve_for_critical > self.max_queue {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "reserve_for_critical cannot exceed max_queue".into(),
            });
        }
        if self.degradation_threshold == 0 || self.degradation_threshold > 100 {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "degradation_threshold must be in 1..=100".into(),
            });
        }
        if self.degradation_recover_threshold >= self.degradation_threshold {
            return Err(EventError::ConfigInvalid {
                bus: self.name,
                reason: "degradation_recover_threshold must be below degradation_threshold".into(),
            });
        }
        Ok(())
    }

    /// Recover threshold defaults to `threshold - 10`, floored at 1 (spec §4.7.6).
    fn recover_threshold(threshold: u8) -> u8 {
        threshold.saturating_sub(10).max(1)
    }

    /// Reasonable defaults per bus type, differing in queue size, batch
    /// size, and priority (spec §6).
    pub fn defaults_for(bus: BusType) -> Self {
        let base = BusConfig {
            name: bus,
            max_queue: 1000,
            flush_interval: Duration::from_millis(50),
            default_priority: Priority::Normal,
            enable_history: true,
            history_size: 500,
            history_max_age: Some(Duration::from_secs(3600)),
            enable_metrics: true,
            max_retries: 3,
            max_concurrent_retries: 32,
            batch_size: 64,
            worker_count: 4,
            enable_degradation: true,
            degradation_threshold: 90,
            degradation_recover_threshold: Self::recover_threshold(90),
            degradation_mode: DegradationMode::Drop,
            enable_throttling: false,
            throttle_rate: 1000.0,
            throttle_burst: 200,
            drop_policy: DropPolicy::DropNewest,
            enqueue_block_timeout: Duration::from_millis(5),
            reserve_for_critical: 0,
        };

        match bus {
            BusType::Plugin => BusConfig {
                max_queue: 2000,
                batch_size: 128,
                worker_count: 4,
                default_priority: Priority::Normal,
                reserve_for_critical: 50,
                ..base
            },
            BusType::System => BusConfig {
                max_queue: 500,
                batch_size: 32,
                worker_count: 2,
                default_priority: Priority::High,
                degradation_mode: DegradationMode::Pause,
                reserve_for_critical: 50,
                ..base
            },
            BusType::Business => BusConfig {
                max_queue: 5000,
                batch_size: 256,
                worker_count: 8,
                default_priority: Priority::Normal,
                ..base
            },
            BusType::Health => BusConfig {
                max_queue: 500,
                batch_size: 32,
                worker_count: 2,
                default_priority: Priority::High,
                enable_throttling: true,
                throttle_rate: 50.0,
                throttle_burst: 10,
                ..base
            },
            BusType::Config => BusConfig {
                max_queue: 300,
                batch_size: 16,
                worker_count: 2,
                default_priority: Priority::Normal,
                ..base
            },
            BusType::Resource => BusConfig {
                max_queue: 1000,
                batch_size: 64,
                worker_count: 4,
                default_priority: Priority::Normal,
                degradation_threshold: 85,
                degradation_recover_threshold: Self::recover_threshold(85),
                ..base
            },
            BusType::Security => BusConfig {
                max_queue: 1000,
                batch_size: 32,
                worker_count: 4,
                default_priority: Priority::Critical,
                reserve_for_critical: 100,
                degradation_mode: DegradationMode::Pause,
                ..base
            },
            BusType::Metrics => BusConfig {
                max_queue: 4000,
                batch_size: 256,
                worker_count: 2,
                default_priority: Priority::Low,
                enable_throttling: true,
                throttle_rate: 2000.0,
                throttle_burst: 500,
                ..base
            },
        }
    }
}

/// Deserializable configuration surface for the whole system (spec §2
/// ambient config): a partial per-bus override map an embedder loads from
/// TOML/JSON. Buses left unnamed fall back to `BusConfig::defaults_for`.
/// The crate itself has no file-loading code — that's the external config
/// loader out of scope per spec.md §1 — only the `Deserialize` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultibusSettings {
    #[serde(default)]
    pub buses: HashMap<BusType, BusConfig>,
}

impl MultibusSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(mut self, bus: BusType, config: BusConfig) -> Self {
        self.buses.insert(bus, config);
        self
    }

    /// Fills in defaults for every `BusType` not explicitly configured and
    /// validates the full set.
    pub fn resolve(&self) -> Result<HashMap<BusType, BusConfig>, EventError> {
        let mut out = HashMap::new();
        for bus in BusType::ALL {
            let cfg = self.buses.get(&bus).cloned().unwrap_or_else(|| BusConfig::defaults_for(bus));
            cfg.validate()?;
            out.insert(bus, cfg);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_every_bus() {
        for bus in BusType::ALL {
            BusConfig::defaults_for(bus).validate().unwrap();
        }
    }

    #[test]
    fn zero_max_queue_is_rejected() {
        let mut cfg = BusConfig::defaults_for(BusType::Business);
        cfg.max_queue = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn recover_threshold_floors_at_one() {
        let mut cfg = BusConfig::defaults_for(BusType::Business);
        cfg.degradation_threshold = 5;
        cfg.degradation_recover_threshold = 4;
        assert!(cfg.validate().is_ok());
        cfg.degradation_recover_threshold = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_resolve_fills_unconfigured_buses_with_defaults() {
        let settings = MultibusSettings::new().with_bus(
            BusType::Security,
            BusConfig { max_queue: 42, ..BusConfig::defaults_for(BusType::Security) },
        );
        let resolved = settings.resolve().unwrap();
        assert_eq!(resolved.len(), BusType::ALL.len());
        assert_eq!(resolved[&BusType::Security].max_queue, 42);
        assert_eq!(resolved[&BusType::Business].max_queue, BusConfig::defaults_for(BusType::Business).max_queue);
    }

    #[test]
    fn settings_resolve_rejects_invalid_override() {
        let mut bad = BusConfig::defaults_for(BusType::Plugin);
        bad.max_queue = 0;
        let settings = MultibusSettings::new().with_bus(BusType::Plugin, bad);
        assert!(settings.resolve().is_err());
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = MultibusSettings::new().with_bus(BusType::Health, BusConfig::defaults_for(BusType::Health));
        let json = serde_json::to_string(&settings).unwrap();
        let back: MultibusSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buses.len(), 1);
    }
}
