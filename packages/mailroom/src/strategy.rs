//! Store selection strategies for the multi-store dispatcher.
//!
//! Given the ordered store list and the cursor carried across iterations,
//! a strategy picks which store the next `run_once` polls. Both built-in
//! strategies return `None` when the list is empty.

use crate::provider::StoreHandle;

/// State carried across dispatcher iterations, consumed by strategies.
#[derive(Debug, Clone, Default)]
pub struct PollCursor {
    /// Identifier of the store polled last iteration.
    pub last_store: Option<String>,
    /// Number of items the last iteration processed.
    pub last_count: usize,
}

impl PollCursor {
    pub fn record(&mut self, store: &str, count: usize) {
        self.last_store = Some(store.to_string());
        self.last_count = count;
    }
}

/// Picks the next store to poll.
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, stores: &'a [StoreHandle], cursor: &PollCursor)
        -> Option<&'a StoreHandle>;
}

/// Advance to the store after the last one polled, wrapping to the first.
/// If the last store is no longer in the list, start over at the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

fn next_after<'a>(stores: &'a [StoreHandle], last: Option<&str>) -> Option<&'a StoreHandle> {
    if stores.is_empty() {
        return None;
    }
    match last.and_then(|id| stores.iter().position(|s| s.identifier() == id)) {
        Some(index) => stores.get((index + 1) % stores.len()),
        None => stores.first(),
    }
}

impl SelectionStrategy for RoundRobin {
    fn select<'a>(
        &self,
        stores: &'a [StoreHandle],
        cursor: &PollCursor,
    ) -> Option<&'a StoreHandle> {
        next_after(stores, cursor.last_store.as_deref())
    }
}

/// Stay on the last store while it keeps yielding work; advance in
/// round-robin order once it runs dry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainFirst;

impl SelectionStrategy for DrainFirst {
    fn select<'a>(
        &self,
        stores: &'a [StoreHandle],
        cursor: &PollCursor,
    ) -> Option<&'a StoreHandle> {
        if cursor.last_count > 0 {
            if let Some(last) = cursor.last_store.as_deref() {
                if let Some(handle) = stores.iter().find(|s| s.identifier() == last) {
                    return Some(handle);
                }
            }
        }
        next_after(stores, cursor.last_store.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::testing::InMemoryStore;

    fn handles(ids: &[&str]) -> Vec<StoreHandle> {
        ids.iter()
            .map(|id| StoreHandle::new(*id, Arc::new(InMemoryStore::new()) as _))
            .collect()
    }

    #[test]
    fn test_round_robin_advances_and_wraps() {
        let stores = handles(&["a", "b", "c"]);
        let mut cursor = PollCursor::default();

        let first = RoundRobin.select(&stores, &cursor).unwrap();
        assert_eq!(first.identifier(), "a");
        cursor.record("a", 0);

        assert_eq!(RoundRobin.select(&stores, &cursor).unwrap().identifier(), "b");
        cursor.record("b", 0);
        assert_eq!(RoundRobin.select(&stores, &cursor).unwrap().identifier(), "c");
        cursor.record("c", 0);
        assert_eq!(RoundRobin.select(&stores, &cursor).unwrap().identifier(), "a");
    }

    #[test]
    fn test_round_robin_resets_when_last_store_vanishes() {
        let stores = handles(&["a", "b"]);
        let cursor = PollCursor {
            last_store: Some("gone".into()),
            last_count: 3,
        };
        assert_eq!(RoundRobin.select(&stores, &cursor).unwrap().identifier(), "a");
    }

    #[test]
    fn test_round_robin_fairness_over_empty_polls() {
        let stores = handles(&["a", "b", "c"]);
        let mut cursor = PollCursor::default();
        let mut polls: HashMap<String, usize> = HashMap::new();

        for _ in 0..31 {
            let handle = RoundRobin.select(&stores, &cursor).unwrap();
            *polls.entry(handle.identifier().to_string()).or_default() += 1;
            cursor.record(handle.identifier(), 0);
        }

        // 31 polls over 3 stores: each store gets 10 or 11.
        for id in ["a", "b", "c"] {
            let count = polls[id];
            assert!((10..=11).contains(&count), "{id} polled {count} times");
        }
    }

    #[test]
    fn test_drain_first_stays_while_productive() {
        let stores = handles(&["a", "b"]);
        let mut cursor = PollCursor::default();

        let first = DrainFirst.select(&stores, &cursor).unwrap();
        assert_eq!(first.identifier(), "a");
        cursor.record("a", 10);

        // Still yielding work: keep draining A.
        assert_eq!(DrainFirst.select(&stores, &cursor).unwrap().identifier(), "a");
        cursor.record("a", 10);
        assert_eq!(DrainFirst.select(&stores, &cursor).unwrap().identifier(), "a");

        // Dry: move on.
        cursor.record("a", 0);
        assert_eq!(DrainFirst.select(&stores, &cursor).unwrap().identifier(), "b");
    }

    #[test]
    fn test_drain_first_advances_when_last_store_vanishes() {
        let stores = handles(&["a", "b"]);
        let cursor = PollCursor {
            last_store: Some("gone".into()),
            last_count: 5,
        };
        assert_eq!(DrainFirst.select(&stores, &cursor).unwrap().identifier(), "a");
    }

    #[test]
    fn test_empty_list_yields_none() {
        let stores: Vec<StoreHandle> = Vec::new();
        let cursor = PollCursor::default();
        assert!(RoundRobin.select(&stores, &cursor).is_none());
        assert!(DrainFirst.select(&stores, &cursor).is_none());
    }
}
