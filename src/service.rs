//! Pool Service
//!
//! Library boundary wiring the store, counters, allocator, provisioner,
//! queries and MAC generator together behind one handle.
//!
//! Callers that share a snapshot file between processes go through
//! [`PoolService::run_with_state`], which serializes load, operation and save
//! on the file's state lock.

use crate::allocation::{PoolAllocator, PoolUsage, QueryService, RangeProvisioner};
use crate::config::NetpoolConfig;
use crate::domain::ports::{
    LeaseRequest, PoolEntry, PoolKind, PoolScope, ReleaseKey, ReleaseOutcome, ScopeId,
};
use crate::error::Result;
use crate::mac::{MacPair, MacSequenceGenerator};
use crate::metrics::PoolMetrics;
use crate::store::{MemoryPoolStore, MemorySequenceCounter, PoolSnapshot, SnapshotFile};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Every pool operation behind one handle
pub struct PoolService {
    config: NetpoolConfig,
    metrics: PoolMetrics,
    store: Arc<MemoryPoolStore>,
    counters: Arc<MemorySequenceCounter>,
    allocator: Arc<PoolAllocator>,
    provisioner: RangeProvisioner,
    queries: QueryService,
    mac: MacSequenceGenerator,
}

impl PoolService {
    /// Create a service over empty pools
    pub fn new(config: NetpoolConfig) -> Result<Self> {
        config.validate()?;
        let metrics = PoolMetrics::new()?;
        Ok(Self::assemble(
            config,
            metrics,
            MemoryPoolStore::new(),
            MemorySequenceCounter::new(),
        ))
    }

    /// Create a service from persisted state
    pub fn from_snapshot(config: NetpoolConfig, snapshot: PoolSnapshot) -> Result<Self> {
        config.validate()?;
        let metrics = PoolMetrics::new()?;
        let (store, counters) = snapshot.restore()?;
        Ok(Self::assemble(config, metrics, store, counters))
    }

    /// Run one operation against the state in `file`
    ///
    /// The state lock is held from load to save, so concurrent runs on the
    /// same file never see each other's intermediate state. With `persist`
    /// the snapshot is saved even when `op` fails: counter values and leases
    /// committed before the failure stay consumed. The error of `op` wins
    /// over a failed save.
    pub async fn run_with_state<T>(
        config: NetpoolConfig,
        file: &SnapshotFile,
        persist: bool,
        op: impl FnOnce(&PoolService) -> Result<T>,
    ) -> Result<(Self, T)> {
        let _lock = file.lock().await?;

        let service = match file.load().await? {
            Some(snapshot) => Self::from_snapshot(config, snapshot)?,
            None => {
                info!("Starting with empty pools at {}", file.path().display());
                Self::new(config)?
            }
        };

        let outcome = op(&service);

        if persist {
            let saved = file.save(&service.snapshot()).await;
            match (&outcome, saved) {
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => error!("Failed to save state after a failed operation: {}", e),
                (_, Ok(())) => {}
            }
        }

        outcome.map(|value| (service, value))
    }

    fn assemble(
        config: NetpoolConfig,
        metrics: PoolMetrics,
        store: Arc<MemoryPoolStore>,
        counters: Arc<MemorySequenceCounter>,
    ) -> Self {
        let allocator = PoolAllocator::new(store.clone(), config.allocator.clone(), metrics.clone());
        let provisioner =
            RangeProvisioner::new(store.clone(), config.provisioning.clone(), metrics.clone());
        let queries = QueryService::new(store.clone());
        let mac = MacSequenceGenerator::new(counters.clone(), config.mac.clone());

        Self {
            config,
            metrics,
            store,
            counters,
            allocator,
            provisioner,
            queries,
            mac,
        }
    }

    pub fn config(&self) -> &NetpoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Take one free entry, failing fast on contention
    pub fn take(&self, scope: PoolScope, request: &LeaseRequest) -> Result<PoolEntry> {
        self.allocator.take(scope, request)
    }

    /// Take one free entry, riding out contention with backoff
    pub fn take_with_backoff(&self, scope: PoolScope, request: &LeaseRequest) -> Result<PoolEntry> {
        self.allocator.take_with_backoff(scope, request)
    }

    pub fn release(&self, scope: PoolScope, key: &ReleaseKey) -> Result<ReleaseOutcome> {
        self.allocator.release(scope, key)
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    pub fn add_range(
        &self,
        kind: PoolKind,
        scope_id: ScopeId,
        start: &str,
        end: &str,
    ) -> Result<usize> {
        self.provisioner.add_range(kind, scope_id, start, end)
    }

    pub fn delete_range(&self, kind: PoolKind, scope_id: ScopeId) -> Result<usize> {
        self.provisioner.delete_range(kind, scope_id)
    }

    pub fn force_delete_range(&self, kind: PoolKind, scope_id: ScopeId) -> Result<usize> {
        self.provisioner.force_delete_range(kind, scope_id)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn list_allocated(&self, scope: PoolScope) -> Vec<PoolEntry> {
        self.queries.list_allocated(scope)
    }

    pub fn list_free(&self, scope: PoolScope) -> Vec<PoolEntry> {
        self.queries.list_free(scope)
    }

    pub fn usage(&self, scope: PoolScope) -> PoolUsage {
        self.queries.usage(scope)
    }

    pub fn scopes(&self) -> Vec<PoolScope> {
        self.queries.scopes()
    }

    // =========================================================================
    // MAC Generation
    // =========================================================================

    pub fn generate_mac_pair(&self, zone_id: ScopeId, mask: u64) -> Result<MacPair> {
        let pair = self.mac.generate_pair(zone_id, mask)?;
        self.metrics.record_mac_pair();
        Ok(pair)
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Capture every row and counter
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot::capture(&self.store, &self.counters)
    }

    /// Replace all state with a snapshot, keeping config and metrics
    pub fn restore(&mut self, snapshot: PoolSnapshot) -> Result<()> {
        let (store, counters) = snapshot.restore()?;
        let entries = store.entries().len();
        *self = Self::assemble(self.config.clone(), self.metrics.clone(), store, counters);
        info!("Restored {} entries from snapshot", entries);
        Ok(())
    }
}

impl fmt::Debug for PoolService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolService")
            .field("config", &self.config)
            .field("scopes", &self.queries.scopes().len())
            .field("next_entry_id", &self.store.next_entry_id())
            .finish_non_exhaustive()
    }
}
