//! Concurrent per-key counters, the in-process `counter_table`.
//!
//! Producers call [`CounterStore::increment`] from any thread; the consumer
//! periodically takes a [`CounterStore::snapshot`] for display.
//!
//! # Thread Safety
//!
//! Entries live in a `DashMap` whose values are `AtomicU64`s. An increment on an
//! existing key takes a shared shard lock and does a single `fetch_add`, so
//! concurrent increments of the same key never serialize on a writer lock and
//! never lose updates. Only the first increment for a key takes the shard's
//! write lock to insert the entry.
//!
//! # Snapshot Consistency
//!
//! A snapshot walks the shards one at a time. Increments racing with the walk
//! may or may not be reflected per entry; once all producers are quiescent a
//! snapshot is exact.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use dashmap::DashMap;

/// Initial capacity for the key map. Keys are uids, so this is rarely exceeded.
const INITIAL_KEY_CAPACITY: usize = 64;

/// Anything the poll loop can take a counter snapshot from.
pub trait CounterSource {
    fn snapshot(&self) -> Result<Vec<(u64, u64)>>;
}

#[derive(Debug)]
pub struct CounterStore {
    counts: DashMap<u64, AtomicU64>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            counts: DashMap::with_capacity(INITIAL_KEY_CAPACITY),
        }
    }

    /// Add one to `key`, creating it at zero first if needed. Returns the new
    /// value.
    pub fn increment(&self, key: u64) -> u64 {
        if let Some(count) = self.counts.get(&key) {
            return count.fetch_add(1, Ordering::Relaxed) + 1;
        }
        // The entry API serializes creators racing on the same key, the loser
        // just increments the winner's counter.
        self.counts
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        self.counts.get(&key).map(|c| c.load(Ordering::Relaxed))
    }

    /// All entries sorted by key.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        let mut entries: Vec<(u64, u64)> = self
            .counts
            .iter()
            .map(|r| (*r.key(), r.value().load(Ordering::Relaxed)))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        entries
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for CounterStore {
    fn snapshot(&self) -> Result<Vec<(u64, u64)>> {
        Ok(CounterStore::snapshot(self))
    }
}
