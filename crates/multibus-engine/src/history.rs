//! Bounded ring of recent events with secondary indexes (spec §4.4).
//!
//! Follows an outer/inner lock split (spec §5): the sequence itself lives
//! behind one lock, the `(plugin id, event type) -> positions` indexes
//! behind another, so a plain scan-by-filter query never blocks an
//! index-rebuild that isn't touching the sequence. Positions are rebuilt
//! from scratch on every trim/cleanup rather than maintained incrementally
//! — simplest way to guarantee "indexes reference only live positions"
//! (invariant 5) once the ring evicts from the front.

use multibus_core::{Event, EventType, Filter};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const CLEANUP_EVERY_N_ADDS: u64 = 100;
const CLEANUP_MAX_IDLE: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct Indexes {
    by_plugin: HashMap<String, Vec<usize>>,
    by_type: HashMap<EventType, Vec<usize>>,
}

pub struct History {
    sequence: RwLock<VecDeque<Event>>,
    indexes: RwLock<Indexes>,
    max_size: AtomicUsize,
    max_age: Option<Duration>,
    add_count: AtomicU64,
    last_cleanup: Mutex<Instant>,
}

impl History {
    pub fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        Self {
            sequence: RwLock::new(VecDeque::with_capacity(max_size.min(1024))),
            indexes: RwLock::new(Indexes::default()),
            max_size: AtomicUsize::new(max_size.max(1)),
            max_age,
            add_count: AtomicU64::new(0),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn add(&self, event: Event) {
        let plugin_id = event.plugin_id.clone();
        let event_type = event.event_type;
        let max_size = self.max_size.load(Ordering::Relaxed);
        let pos;
        let overflowed;
        {
            let mut seq = self.sequence.write();
            seq.push_back(event);
            pos = seq.len() - 1;
            overflowed = seq.len() > max_size;
            if overflowed {
                while seq.len() > max_size {
                    seq.pop_front();
                }
                self.rebuild_indexes_locked(&seq);
            }
        }

        // The overflow branch already rebuilt indexes for the whole window
        // above (under the sequence write lock); on the common path we just
        // index the entry we captured the position for.
        if !overflowed {
            let mut idx = self.indexes.write();
            idx.by_plugin.entry(plugin_id).or_default().push(pos);
            idx.by_type.entry(event_type).or_default().push(pos);
        }

        let add_count = self.add_count.fetch_add(1, Ordering::Relaxed) + 1;
        let idle_too_long = self.last_cleanup.lock().elapsed() > CLEANUP_MAX_IDLE;
        if self.max_age.is_some() && (add_count % CLEANUP_EVERY_N_ADDS == 0 || idle_too_long) {
            self.cleanup();
        }
    }

    fn rebuild_indexes_locked(&self, seq: &VecDeque<Event>) {
        let mut idx = self.indexes.write();
        idx.by_plugin.clear();
        idx.by_type.clear();
        for (pos, ev) in seq.iter().enumerate() {
            idx.by_plugin.entry(ev.plugin_id.clone()).or_default().push(pos);
            idx.by_type.entry(ev.event_type).or_default().push(pos);
        }
    }

    /// Purges entries older than `max_age` and rebuilds indexes (spec §4.4).
    pub fn cleanup(&self) {
        let Some(max_age) = self.max_age else { return };
        let cutoff = now_unix() - max_age.as_secs() as i64;
        let mut seq = self.sequence.write();
        seq.retain(|e| e.timestamp >= cutoff);
        self.rebuild_indexes_locked(&seq);
        *self.last_cleanup.lock() = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.sequence.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn by_plugin_id(&self, plugin_id: &str) -> Vec<Event> {
        let positions = {
            let idx = self.indexes.read();
            idx.by_plugin.get(plugin_id).cloned().unwrap_or_default()
        };
        let seq = self.sequence.read();
        positions
            .into_iter()
            .filter_map(|pos| seq.get(pos).cloned())
            .collect()
    }

    pub fn by_event_type(&self, event_type: EventType) -> Vec<Event> {
        let positions = {
            let idx = self.indexes.read();
            idx.by_type.get(&event_type).cloned().unwrap_or_default()
        };
        let seq = self.sequence.read();
        positions
            .into_iter()
            .filter_map(|pos| seq.get(pos).cloned())
            .collect()
    }

    /// Filter-based and time-range queries scan the live window directly
    /// (spec §4.4: "Queries by filter or time range scan the live window").
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        self.sequence
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Rebuilds the ring to a new capacity, used by `Bus::update_config`
    /// hot-reconfiguration of `HistorySize` (spec §4.7.7).
    pub fn resize(&self, new_max_size: usize) {
        let new_max_size = new_max_size.max(1);
        self.max_size.store(new_max_size, Ordering::Relaxed);
        let mut seq = self.sequence.write();
        while seq.len() > new_max_size {
            seq.pop_front();
        }
        self.rebuild_indexes_locked(&seq);
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use multibus_core::{well_known, Event};

    fn ev(plugin: &str, ty: EventType) -> Event {
        Event::new(ty, plugin, "src")
    }

    #[test]
    fn size_never_exceeds_max() {
        let h = History::new(3, None);
        for i in 0..10 {
            h.add(ev(&format!("p{i}"), well_known::HEALTH_CHECK));
        }
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn indexes_point_at_live_entries_after_overflow() {
        let h = History::new(2, None);
        h.add(ev("p1", well_known::PLUGIN_STARTED));
        h.add(ev("p2", well_known::PLUGIN_STARTED));
        h.add(ev("p3", well_known::PLUGIN_STARTED));

        assert!(h.by_plugin_id("p1").is_empty());
        let found = h.by_plugin_id("p3");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plugin_id, "p3");
    }

    #[test]
    fn by_event_type_index_lookup() {
        let h = History::new(10, None);
        h.add(ev("p1", well_known::PLUGIN_STARTED));
        h.add(ev("p1", well_known::PLUGIN_STOPPED));
        let started = h.by_event_type(well_known::PLUGIN_STARTED);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].event_type, well_known::PLUGIN_STARTED);
    }

    #[test]
    fn query_by_filter_scans_live_window() {
        let h = History::new(10, None);
        h.add(ev("p1", well_known::PLUGIN_STARTED));
        h.add(ev("p2", well_known::PLUGIN_STOPPED));
        let filter = Filter::new().with_plugin_ids(["p2".to_string()]);
        let found = h.query(&filter);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plugin_id, "p2");
    }

    #[test]
    fn cleanup_purges_entries_older_than_max_age() {
        let h = History::new(10, Some(Duration::from_secs(60)));
        let mut old = ev("p1", well_known::PLUGIN_STARTED);
        old.timestamp = now_unix() - 120;
        h.add(old);
        h.add(ev("p2", well_known::PLUGIN_STARTED));
        h.cleanup();
        assert_eq!(h.len(), 1);
        assert_eq!(h.by_plugin_id("p1").len(), 0);
    }
}
