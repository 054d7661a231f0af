//! Bounded window of recently seen envelope ids.
//!
//! Pub/sub transports may redeliver around a resubscribe. Remembering the
//! last few thousand ids for a few minutes is enough to drop those repeats
//! without unbounded growth.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Default maximum age for remembered ids.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

pub(crate) struct RecentIds {
    order: VecDeque<(Uuid, Instant)>,
    seen: HashSet<Uuid>,
    max_entries: usize,
    max_age: Duration,
}

impl RecentIds {
    pub fn new(max_entries: usize) -> Self {
        Self::with_max_age(max_entries, DEFAULT_MAX_AGE)
    }

    pub fn with_max_age(max_entries: usize, max_age: Duration) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Record `id`. Returns false if it was already in the window.
    pub fn insert(&mut self, id: Uuid) -> bool {
        self.evict_expired();

        if self.seen.contains(&id) {
            return false;
        }

        while self.order.len() >= self.max_entries {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }

        self.order.push_back((id, Instant::now()));
        self.seen.insert(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) <= self.max_age {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_is_rejected() {
        let mut ids = RecentIds::new(8);
        let id = Uuid::new_v4();
        assert!(ids.insert(id));
        assert!(!ids.insert(id));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut ids = RecentIds::new(3);
        let first = Uuid::new_v4();
        ids.insert(first);
        for _ in 0..3 {
            ids.insert(Uuid::new_v4());
        }
        assert_eq!(ids.len(), 3);
        // Fell out of the window, so it is accepted again.
        assert!(ids.insert(first));
    }

    #[test]
    fn expired_ids_are_forgotten() {
        let mut ids = RecentIds::with_max_age(16, Duration::ZERO);
        let id = Uuid::new_v4();
        assert!(ids.insert(id));
        std::thread::sleep(Duration::from_millis(2));
        assert!(ids.insert(id));
    }
}
