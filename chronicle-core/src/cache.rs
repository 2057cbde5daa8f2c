//! Bounded, deduplicated event cache
//!
//! Events arrive from two sources (page fetches and the live stream) with
//! at-least-once delivery. The cache keeps them newest-first, never holds
//! two events with the same id, and never grows past its configured bound.
//!
//! Ids stay in the membership set after their event is evicted, so a late
//! duplicate of an evicted event is still rejected instead of re-admitted
//! at the head of the list.

use std::collections::{HashSet, VecDeque};

use crate::types::Event;

#[derive(Debug)]
pub struct EventCache {
    events: VecDeque<Event>,
    seen: HashSet<String>,
    max_size: usize,
}

impl EventCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::new(),
            seen: HashSet::new(),
            max_size: max_size.max(1),
        }
    }

    /// Admit a pushed event at the head.
    ///
    /// Returns false (and changes nothing) if the id was already seen.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.seen.contains(&event.id) {
            return false;
        }
        self.seen.insert(event.id.clone());
        self.events.push_front(event);
        self.enforce_bound();
        true
    }

    /// Merge a fetched page behind the cached events.
    ///
    /// The page is ordered by timestamp descending first so that it lines
    /// up with push ordering. Returns how many events were admitted.
    pub fn merge_page(&mut self, mut page: Vec<Event>) -> usize {
        page.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut admitted = 0;
        for event in page {
            if self.seen.insert(event.id.clone()) {
                self.events.push_back(event);
                admitted += 1;
            }
        }
        self.enforce_bound();
        admitted
    }

    fn enforce_bound(&mut self) {
        if self.events.len() > self.max_size {
            let evicted = self.events.len() - self.max_size;
            self.events.truncate(self.max_size);
            tracing::trace!(evicted, max_size = self.max_size, "Evicted oldest cached events");
        }
    }

    /// Forget every event and every seen id.
    pub fn reset(&mut self) {
        self.events.clear();
        self.seen.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use chrono::{Duration, TimeZone, Utc};

    fn event(id: &str, minute: i64) -> Event {
        Event {
            id: id.to_string(),
            session_id: "s1".to_string(),
            event_type: EventType::PostToolUse,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
            metadata: serde_json::Value::Null,
            tool_name: None,
            duration_ms: None,
        }
    }

    fn ids(cache: &EventCache) -> Vec<&str> {
        cache.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_push_is_newest_first() {
        let mut cache = EventCache::new(10);
        assert!(cache.insert(event("a", 0)));
        assert!(cache.insert(event("b", 1)));
        assert_eq!(ids(&cache), vec!["b", "a"]);
    }

    #[test]
    fn test_duplicate_push_is_discarded() {
        let mut cache = EventCache::new(10);
        assert!(cache.insert(event("a", 0)));
        assert!(!cache.insert(event("a", 5)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_across_fetch_and_push() {
        let mut cache = EventCache::new(10);
        assert_eq!(cache.merge_page(vec![event("a", 0), event("b", 1)]), 2);
        assert!(!cache.insert(event("b", 1)));

        let mut cache = EventCache::new(10);
        assert!(cache.insert(event("c", 2)));
        assert_eq!(cache.merge_page(vec![event("c", 2), event("d", 1)]), 1);
        assert_eq!(ids(&cache), vec!["c", "d"]);
    }

    #[test]
    fn test_page_is_sorted_descending() {
        let mut cache = EventCache::new(10);
        cache.merge_page(vec![event("old", 0), event("new", 9), event("mid", 4)]);
        assert_eq!(ids(&cache), vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_bound_and_no_readmission_after_eviction() {
        let max = 5;
        let mut cache = EventCache::new(max);
        for i in 0..20 {
            cache.insert(event(&format!("e{}", i), i));
            assert!(cache.len() <= max);
        }
        assert_eq!(ids(&cache), vec!["e19", "e18", "e17", "e16", "e15"]);

        // e0 was evicted long ago; a late duplicate must still be rejected
        assert!(!cache.insert(event("e0", 0)));
        assert_eq!(cache.merge_page(vec![event("e3", 3)]), 0);
        assert_eq!(cache.len(), max);
    }

    #[test]
    fn test_reset_forgets_ids() {
        let mut cache = EventCache::new(3);
        cache.insert(event("a", 0));
        cache.reset();
        assert!(cache.is_empty());
        assert!(cache.insert(event("a", 0)));
    }
}
