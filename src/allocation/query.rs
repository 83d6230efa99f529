//! Pool Queries
//!
//! Read-only views over pool state. Results are point-in-time snapshots and
//! may be stale by the time the caller looks at them.

use crate::domain::ports::{EntryFilter, PoolEntry, PoolScope, PoolStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Occupancy summary of one pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub scope: PoolScope,
    pub total: usize,
    pub allocated: usize,
    pub free: usize,
    pub utilization_percent: f64,
}

/// Read-only access to pools
pub struct QueryService {
    store: Arc<dyn PoolStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn PoolStore>) -> Self {
        Self { store }
    }

    /// Taken entries, ordered by id
    pub fn list_allocated(&self, scope: PoolScope) -> Vec<PoolEntry> {
        self.store.scan(scope, &EntryFilter::taken())
    }

    /// Free entries, ordered by id
    pub fn list_free(&self, scope: PoolScope) -> Vec<PoolEntry> {
        self.store.scan(scope, &EntryFilter::free())
    }

    pub fn count_free(&self, scope: PoolScope) -> usize {
        self.store.counts(scope).free()
    }

    pub fn count_allocated(&self, scope: PoolScope) -> usize {
        self.store.counts(scope).taken
    }

    pub fn usage(&self, scope: PoolScope) -> PoolUsage {
        let counts = self.store.counts(scope);
        let utilization_percent = if counts.total == 0 {
            0.0
        } else {
            counts.taken as f64 / counts.total as f64 * 100.0
        };
        PoolUsage {
            scope,
            total: counts.total,
            allocated: counts.taken,
            free: counts.free(),
            utilization_percent,
        }
    }

    pub fn find_by_value(&self, scope: PoolScope, value: &str) -> Option<PoolEntry> {
        let filter = EntryFilter {
            value: Some(value.to_string()),
            ..Default::default()
        };
        self.store.scan(scope, &filter).into_iter().next()
    }

    pub fn list_by_owner(&self, scope: PoolScope, owner_id: u64) -> Vec<PoolEntry> {
        let filter = EntryFilter {
            owner_id: Some(owner_id),
            ..EntryFilter::taken()
        };
        self.store.scan(scope, &filter)
    }

    pub fn find_by_reservation(&self, scope: PoolScope, reservation_id: &str) -> Vec<PoolEntry> {
        let filter = EntryFilter {
            reservation_id: Some(reservation_id.to_string()),
            ..EntryFilter::taken()
        };
        self.store.scan(scope, &filter)
    }

    /// Every provisioned pool, in key order
    pub fn scopes(&self) -> Vec<PoolScope> {
        let mut scopes = self.store.scopes();
        scopes.sort();
        scopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{PoolAllocator, RangeProvisioner};
    use crate::config::{AllocatorConfig, ProvisionerConfig};
    use crate::domain::ports::{LeaseRequest, PoolKind, ScopeId};
    use crate::metrics::PoolMetrics;
    use crate::store::MemoryPoolStore;

    fn populated() -> (QueryService, PoolScope) {
        let store = MemoryPoolStore::new();
        let metrics = PoolMetrics::new().unwrap();
        RangeProvisioner::new(store.clone(), ProvisionerConfig::default(), metrics.clone())
            .add_range(PoolKind::PrivateIp, ScopeId(7), "10.0.0.1", "10.0.0.8")
            .unwrap();
        let scope = PoolScope::new(PoolKind::PrivateIp, 7);

        let allocator = PoolAllocator::new(store.clone(), AllocatorConfig::default(), metrics);
        allocator.take(scope, &LeaseRequest::new(1)).unwrap();
        allocator.take(scope, &LeaseRequest::new(1)).unwrap();
        allocator
            .take(scope, &LeaseRequest::new(2).with_reservation("r-9"))
            .unwrap();

        (QueryService::new(store), scope)
    }

    #[test]
    fn test_counts_and_usage() {
        let (queries, scope) = populated();
        assert_eq!(queries.count_allocated(scope), 3);
        assert_eq!(queries.count_free(scope), 5);

        let usage = queries.usage(scope);
        assert_eq!(usage.total, 8);
        assert_eq!(usage.allocated, 3);
        assert_eq!(usage.free, 5);
        assert!((usage.utilization_percent - 37.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_listings_partition_the_pool() {
        let (queries, scope) = populated();
        let allocated = queries.list_allocated(scope);
        let free = queries.list_free(scope);
        assert_eq!(allocated.len() + free.len(), 8);
        assert!(allocated.iter().all(|e| !e.is_free()));
        assert!(free.iter().all(|e| e.is_free()));
        assert!(allocated.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_lookups() {
        let (queries, scope) = populated();
        assert_eq!(queries.list_by_owner(scope, 1).len(), 2);
        assert!(queries.list_by_owner(scope, 3).is_empty());

        let reserved = queries.find_by_reservation(scope, "r-9");
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].owner_id, Some(2));

        let entry = queries.find_by_value(scope, "10.0.0.4").unwrap();
        assert_eq!(entry.value, "10.0.0.4");
        assert!(queries.find_by_value(scope, "10.0.0.99").is_none());
    }

    #[test]
    fn test_empty_scope() {
        let (queries, _) = populated();
        let empty = PoolScope::new(PoolKind::PodVlan, 1);
        let usage = queries.usage(empty);
        assert_eq!(usage.total, 0);
        assert_eq!(usage.utilization_percent, 0.0);
        assert!(queries.list_allocated(empty).is_empty());
        assert_eq!(queries.scopes(), vec![PoolScope::new(PoolKind::PrivateIp, 7)]);
    }
}
