//! Named Sequence Counters
//!
//! Monotonic counters keyed by generator name. The first read of a fresh
//! counter returns 1; values never wrap.

use crate::domain::ports::SequenceCounter;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// First value handed out by a fresh counter
pub const SEQUENCE_START: u64 = 1;

/// In-process counter table, persisted through the pool snapshot
#[derive(Debug, Default)]
pub struct MemorySequenceCounter {
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl MemorySequenceCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Restore counters from persisted `name -> next value` rows
    pub fn from_values(values: BTreeMap<String, u64>) -> Arc<Self> {
        let counters = DashMap::new();
        for (name, next) in values {
            counters.insert(name, Arc::new(AtomicU64::new(next.max(SEQUENCE_START))));
        }
        Arc::new(Self { counters })
    }

    /// Persistable `name -> next value` rows
    pub fn values(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|c| (c.key().clone(), c.value().load(Ordering::SeqCst)))
            .collect()
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.get(name) {
            return counter.value().clone();
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(SEQUENCE_START)))
            .value()
            .clone()
    }
}

impl SequenceCounter for MemorySequenceCounter {
    fn next(&self, name: &str) -> Result<u64> {
        self.counter(name)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map_err(|value| Error::SequenceExhausted {
                name: name.to_string(),
                value,
            })
    }

    fn peek(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.value().load(Ordering::SeqCst))
            .unwrap_or(SEQUENCE_START)
    }
}
