//! Declarative, composable predicate over events.

use crate::event::{Event, EventStatus, EventType, Metadata, Priority};
use serde::{Deserialize, Serialize};

/// A set-of-allowed-values filter. An empty set on any field means "no
/// constraint on this field" (spec §3/§4.2). Filters are cheap to clone —
/// registration always clones so a caller mutating their copy afterward
/// cannot race delivery (spec invariant 9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub event_types: Vec<EventType>,
    pub priorities: Vec<Priority>,
    pub sources: Vec<String>,
    pub categories: Vec<String>,
    pub plugin_ids: Vec<String>,
    pub statuses: Vec<EventStatus>,
    /// Every listed key must deep-equal the event's corresponding metadata value.
    pub metadata: Metadata,
    /// Inclusive `[start, end]` unix-second bound on `Event::timestamp`.
    pub time_range: Option<(i64, i64)>,
    /// When `Some(true)`, only events carrying an error match; when
    /// `Some(false)`, only events without one; `None` means unconstrained.
    pub has_error: Option<bool>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn with_plugin_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.plugin_ids = ids.into_iter().collect();
        self
    }

    pub fn with_priorities(mut self, priorities: impl IntoIterator<Item = Priority>) -> Self {
        self.priorities = priorities.into_iter().collect();
        self
    }

    pub fn with_has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    /// True when every field is unconstrained — "match everything" (spec §4.2).
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
            && self.priorities.is_empty()
            && self.sources.is_empty()
            && self.categories.is_empty()
            && self.plugin_ids.is_empty()
            && self.statuses.is_empty()
            && self.metadata.is_empty()
            && self.time_range.is_none()
            && self.has_error.is_none()
    }

    /// A filter that names event types is eligible for the bus's cheaper
    /// per-type subscription path (spec §4.2).
    pub fn is_type_scoped(&self) -> bool {
        !self.event_types.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&event.priority) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&event.category) {
            return false;
        }
        if !self.plugin_ids.is_empty() && !self.plugin_ids.contains(&event.plugin_id) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&event.status) {
            return false;
        }
        for (key, want) in &self.metadata {
            match event.metadata.get(key) {
                Some(have) if have == want => {}
                _ => return false,
            }
        }
        if let Some((start, end)) = self.time_range {
            if event.timestamp < start || event.timestamp > end {
                return false;
            }
        }
        if let Some(want_error) = self.has_error {
            if event.error.is_some() != want_error {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::well_known;

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::new();
        assert!(f.is_empty());
        let ev = Event::new(well_known::PLUGIN_STARTED, "p1", "src");
        assert!(f.matches(&ev));
    }

    #[test]
    fn plugin_and_type_constraint() {
        let f = Filter::new()
            .with_plugin_ids(["p1".to_string()])
            .with_event_types([well_known::PLUGIN_STARTED]);
        assert!(!f.is_empty());
        assert!(f.is_type_scoped());

        let matching = Event::new(well_known::PLUGIN_STARTED, "p1", "src");
        let wrong_plugin = Event::new(well_known::PLUGIN_STARTED, "p2", "src");
        let wrong_type = Event::new(well_known::PLUGIN_STOPPED, "p1", "src");

        assert!(f.matches(&matching));
        assert!(!f.matches(&wrong_plugin));
        assert!(!f.matches(&wrong_type));
    }

    #[test]
    fn metadata_deep_equality() {
        let mut meta = Metadata::new();
        meta.insert("region".into(), serde_json::json!("eu"));
        let f = Filter {
            metadata: meta,
            ..Filter::new()
        };

        let mut ev_meta = Metadata::new();
        ev_meta.insert("region".into(), serde_json::json!("eu"));
        let matching = Event::new(well_known::HEALTH_CHECK, "p1", "src").with_metadata(ev_meta);
        assert!(f.matches(&matching));

        let mut other_meta = Metadata::new();
        other_meta.insert("region".into(), serde_json::json!("us"));
        let non_matching =
            Event::new(well_known::HEALTH_CHECK, "p1", "src").with_metadata(other_meta);
        assert!(!f.matches(&non_matching));
    }

    #[test]
    fn clone_is_independent_of_original() {
        let mut f = Filter::new().with_plugin_ids(["p1".to_string()]);
        let clone = f.clone();
        f.plugin_ids.push("p2".to_string());
        assert_eq!(clone.plugin_ids, vec!["p1".to_string()]);
    }

    #[test]
    fn has_error_predicate() {
        let f = Filter::new().with_has_error(true);
        let with_err = Event::new(well_known::ERROR_OCCURRED, "p1", "src").with_error("boom");
        let without_err = Event::new(well_known::ERROR_OCCURRED, "p1", "src");
        assert!(f.matches(&with_err));
        assert!(!f.matches(&without_err));
    }
}
