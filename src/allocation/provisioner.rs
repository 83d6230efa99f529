//! Range Provisioner
//!
//! Administrative population and teardown of pools.

use super::range::PoolRange;
use crate::config::ProvisionerConfig;
use crate::domain::ports::{PoolKind, PoolScope, PoolStore, ScopeId};
use crate::error::Result;
use crate::metrics::PoolMetrics;
use std::sync::Arc;
use tracing::{info, warn};

/// Range metric operation labels
pub const OP_ADD: &str = "add";
pub const OP_DELETE: &str = "delete";

/// Adds and removes whole ranges of pool entries
pub struct RangeProvisioner {
    store: Arc<dyn PoolStore>,
    config: ProvisionerConfig,
    metrics: PoolMetrics,
}

impl RangeProvisioner {
    pub fn new(store: Arc<dyn PoolStore>, config: ProvisionerConfig, metrics: PoolMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Insert one free entry per value in the range
    ///
    /// The range is validated before any mutation and the batch is atomic:
    /// a duplicate value inserts nothing.
    pub fn add_range(
        &self,
        kind: PoolKind,
        scope_id: ScopeId,
        start: &str,
        end: &str,
    ) -> Result<usize> {
        let range = PoolRange::parse(kind, start, end)?;
        range.check_size(self.config.max_range_entries)?;

        let scope = PoolScope::new(kind, scope_id);
        let inserted = self.store.insert_batch(scope, range.values())?;
        self.metrics.record_range(kind, OP_ADD, inserted as u64);

        info!("Provisioned {} entries into {} from {}", inserted, scope, range);
        Ok(inserted)
    }

    /// Delete every entry of a pool, refusing while any entry is taken
    pub fn delete_range(&self, kind: PoolKind, scope_id: ScopeId) -> Result<usize> {
        let scope = PoolScope::new(kind, scope_id);
        let removed = self.store.delete_scope(scope, false, self.config.lock_wait())?;
        self.metrics.record_range(kind, OP_DELETE, removed.len() as u64);

        info!("Deleted {} entries from {}", removed.len(), scope);
        Ok(removed.len())
    }

    /// Delete every entry of a pool, orphaning any live leases
    pub fn force_delete_range(&self, kind: PoolKind, scope_id: ScopeId) -> Result<usize> {
        let scope = PoolScope::new(kind, scope_id);
        let removed = self.store.delete_scope(scope, true, self.config.lock_wait())?;
        self.metrics.record_range(kind, OP_DELETE, removed.len() as u64);

        let orphaned = removed.iter().filter(|e| !e.is_free()).count();
        if orphaned > 0 {
            warn!(
                "Force-deleted {} entries from {}, orphaning {} live leases",
                removed.len(),
                scope,
                orphaned
            );
        } else {
            info!("Deleted {} entries from {}", removed.len(), scope);
        }
        Ok(removed.len())
    }
}
