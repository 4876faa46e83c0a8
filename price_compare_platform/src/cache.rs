//! Two-tier result cache.
//!
//! The global tier maps a query to its finalized result and is shared by
//! every requester. The pointer tier maps a requester to the item set it is
//! currently browsing, so downstream ranking can find it without a query.
//! Entries are replaced wholesale, never mutated in place.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::item::{Filters, Item};

/// A finalized search result as stored in the global tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSearch {
    pub items: Arc<Vec<Item>>,
    pub filters: Filters,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub query_entries: usize,
    pub requester_entries: usize,
    /// Finalized results written to the global tier since startup.
    pub query_writes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
pub struct ResultCache {
    by_query: RwLock<HashMap<String, Arc<CachedSearch>>>,
    by_requester: RwLock<HashMap<String, Arc<Vec<Item>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self))]
    pub fn get_by_query(&self, query: &str) -> Option<Arc<CachedSearch>> {
        let entry = self.by_query.read().get(query).cloned();
        match entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    /// Store the finalized result for `query`, replacing any previous entry.
    pub fn put_by_query(&self, query: &str, items: Arc<Vec<Item>>, filters: Filters) {
        let entry = Arc::new(CachedSearch {
            items,
            filters,
            cached_at: Utc::now(),
        });
        debug!("Caching {} items for query '{}'", entry.items.len(), query);
        self.by_query.write().insert(query.to_string(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_for_requester(&self, requester: &str, items: Arc<Vec<Item>>) {
        self.by_requester
            .write()
            .insert(requester.to_string(), items);
    }

    pub fn get_current_for_requester(&self, requester: &str) -> Option<Arc<Vec<Item>>> {
        self.by_requester.read().get(requester).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;

        CacheStats {
            query_entries: self.by_query.read().len(),
            requester_entries: self.by_requester.read().len(),
            query_writes: self.writes.load(Ordering::Relaxed),
            hit_count,
            miss_count,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(urls: &[&str]) -> Arc<Vec<Item>> {
        Arc::new(
            urls.iter()
                .map(|u| Item::new(format!("Nike {u}"), 10.0, "img", *u, "Nike").categorized())
                .collect(),
        )
    }

    #[test]
    fn test_query_tier_overwrites_wholesale() {
        let cache = ResultCache::new();
        assert!(cache.get_by_query("boots").is_none());

        let first = items(&["a", "b"]);
        cache.put_by_query("boots", first.clone(), Filters::from_items(&first).unwrap());
        let before = cache.get_by_query("boots").unwrap();

        let second = items(&["c"]);
        cache.put_by_query("boots", second.clone(), Filters::from_items(&second).unwrap());
        let after = cache.get_by_query("boots").unwrap();

        // Readers holding the old entry still see the old data.
        assert_eq!(before.items.len(), 2);
        assert_eq!(after.items.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.query_entries, 1);
        assert_eq!(stats.query_writes, 2);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_requester_pointer_tier() {
        let cache = ResultCache::new();
        assert!(cache.get_current_for_requester("alice").is_none());

        let set = items(&["a"]);
        cache.set_current_for_requester("alice", set.clone());
        let current = cache.get_current_for_requester("alice").unwrap();
        assert!(Arc::ptr_eq(&current, &set));
        assert!(cache.get_current_for_requester("bob").is_none());
    }
}
