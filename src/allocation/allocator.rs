//! Pool Allocator
//!
//! Hands out and returns pool entries. A take picks a random free row, locks
//! it with a bounded wait and marks it taken in one row transaction; losing a
//! race to another transaction only costs a retry with a fresh pick.

use crate::config::AllocatorConfig;
use crate::domain::ports::{
    EntryFilter, EntryId, EntryState, LeaseRequest, PoolEntry, PoolScope, PoolStore,
    ReleaseKey, ReleaseOutcome, RowUpdate,
};
use crate::error::{Error, Result};
use crate::metrics::{
    PoolMetrics, OUTCOME_CONTENTION, OUTCOME_EXHAUSTED, OUTCOME_NOT_ALLOCATED, OUTCOME_OK,
    OUTCOME_RELEASED, OUTCOME_REUSED,
};
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// First delay of [`PoolAllocator::take_with_backoff`]
const BACKOFF_INITIAL_INTERVAL: Duration = Duration::from_millis(25);

/// Lock stripes shared by all reservation keys
const RESERVATION_LOCK_STRIPES: usize = 64;

// =============================================================================
// Pool Allocator
// =============================================================================

/// Take/release engine over a [`PoolStore`]
pub struct PoolAllocator {
    /// Durable rows
    store: Arc<dyn PoolStore>,
    /// Attempt and lock-wait bounds
    config: AllocatorConfig,
    /// Outcome counters
    metrics: PoolMetrics,
    /// Serializes takes that share a (scope, reservation) key
    reservation_locks: Vec<Mutex<()>>,
}

impl PoolAllocator {
    /// Create a new allocator
    pub fn new(store: Arc<dyn PoolStore>, config: AllocatorConfig, metrics: PoolMetrics) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            metrics,
            reservation_locks: (0..RESERVATION_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Take one free entry from a pool
    ///
    /// A request carrying a reservation id that already holds an entry in the
    /// scope gets that entry back unchanged; concurrent takes sharing a
    /// reservation are serialized. Fails with `PoolExhausted` when no free
    /// row exists and `Contention` when every attempt lost its row.
    pub fn take(&self, scope: PoolScope, request: &LeaseRequest) -> Result<PoolEntry> {
        let reservation_id = match request.reservation_id.as_deref() {
            Some(reservation_id) => reservation_id,
            None => return self.take_free(scope, request),
        };

        // Held across the lookup and the take so one reservation leases once
        let stripe = self.reservation_lock(scope, reservation_id);
        let _guard = match stripe.try_lock_for(self.config.lock_wait()) {
            Some(guard) => guard,
            None => {
                self.metrics.record_take(scope.kind, OUTCOME_CONTENTION);
                warn!(
                    "Timed out waiting on reservation {} in {}",
                    reservation_id, scope
                );
                return Err(Error::Contention { scope, attempts: 0 });
            }
        };

        if let Some(existing) = self.existing_lease(scope, request.owner_id, reservation_id) {
            debug!(
                "Reservation {} already holds {} in {}",
                reservation_id, existing.value, scope
            );
            self.metrics.record_take(scope.kind, OUTCOME_REUSED);
            return Ok(existing);
        }
        self.take_free(scope, request)
    }

    fn take_free(&self, scope: PoolScope, request: &LeaseRequest) -> Result<PoolEntry> {
        let mut tried: HashSet<EntryId> = HashSet::new();
        for attempt in 1..=self.config.max_take_attempts {
            let free = self.store.free_ids(scope);
            let candidate = match pick_candidate(&free, &tried) {
                Some(id) => id,
                None => {
                    self.metrics.record_take(scope.kind, OUTCOME_EXHAUSTED);
                    warn!("Pool {} exhausted", scope);
                    return Err(Error::PoolExhausted { scope });
                }
            };
            tried.insert(candidate);
            debug!(
                "Take attempt {} in {}: row {} of {} free",
                attempt,
                scope,
                candidate,
                free.len()
            );

            let result = self
                .store
                .update_row(scope, candidate, self.config.lock_wait(), &mut |entry| {
                    if entry.is_free() {
                        entry.mark_taken(request);
                        true
                    } else {
                        false
                    }
                });

            match result {
                Ok(RowUpdate::Committed(entry)) => {
                    self.metrics.record_take(scope.kind, OUTCOME_OK);
                    self.metrics.record_take_attempts(attempt);
                    info!(
                        "Leased {} in {} to owner {}",
                        entry.value, scope, request.owner_id
                    );
                    return Ok(entry);
                }
                Ok(RowUpdate::Unchanged(_)) => {
                    debug!("Row {} in {} was taken concurrently", candidate, scope);
                }
                Err(Error::LockTimeout { .. }) => {
                    debug!("Lock wait on row {} in {} timed out", candidate, scope);
                }
                Err(Error::EntryNotFound { .. }) => {
                    debug!("Row {} in {} was deleted concurrently", candidate, scope);
                }
                Err(e) => return Err(e),
            }
            self.metrics.record_contention_retry(scope.kind);
        }

        self.metrics.record_take(scope.kind, OUTCOME_CONTENTION);
        warn!(
            "Giving up on {} after {} contended attempts",
            scope, self.config.max_take_attempts
        );
        Err(Error::Contention {
            scope,
            attempts: self.config.max_take_attempts,
        })
    }

    /// Take, retrying transient failures with exponential backoff
    ///
    /// Blocks the calling thread between attempts; permanent errors such as
    /// `PoolExhausted` return immediately.
    pub fn take_with_backoff(&self, scope: PoolScope, request: &LeaseRequest) -> Result<PoolEntry> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(BACKOFF_INITIAL_INTERVAL)
            .with_max_elapsed_time(Some(self.config.retry_max_elapsed()))
            .build();

        backoff::retry(policy, || {
            self.take(scope, request).map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .map_err(|e| match e {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }

    /// Return entries matching `key` to the free state
    ///
    /// Each matching row is cleared in its own row transaction. Nothing
    /// taken matching the key is not an error: the outcome is
    /// `NotAllocated`.
    pub fn release(&self, scope: PoolScope, key: &ReleaseKey) -> Result<ReleaseOutcome> {
        let candidates = self.store.scan(scope, &release_filter(key));

        let mut released = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut before = None;
            let result = self
                .store
                .update_row(scope, candidate.id, self.config.lock_wait(), &mut |entry| {
                    if key.matches(entry) {
                        before = Some(entry.clone());
                        entry.mark_free();
                        true
                    } else {
                        false
                    }
                });

            match result {
                Ok(RowUpdate::Committed(_)) => released.extend(before),
                Ok(RowUpdate::Unchanged(_)) | Err(Error::EntryNotFound { .. }) => {
                    debug!("Row {} in {} changed before release", candidate.id, scope);
                }
                Err(Error::LockTimeout { .. }) => {
                    self.metrics.record_release(scope.kind, OUTCOME_CONTENTION, 1);
                    warn!(
                        "Release of {} in {} timed out on its row lock",
                        candidate.value, scope
                    );
                    return Err(Error::Contention { scope, attempts: 1 });
                }
                Err(e) => return Err(e),
            }
        }

        if released.is_empty() {
            self.metrics.record_release(scope.kind, OUTCOME_NOT_ALLOCATED, 1);
            warn!("Release of {} in {}: nothing allocated", key, scope);
            return Ok(ReleaseOutcome::NotAllocated);
        }

        self.metrics
            .record_release(scope.kind, OUTCOME_RELEASED, released.len() as u64);
        for entry in &released {
            info!(
                "Released {} in {} from owner {}",
                entry.value,
                scope,
                entry.owner_id.unwrap_or_default()
            );
        }
        Ok(ReleaseOutcome::Released(released))
    }

    fn reservation_lock(&self, scope: PoolScope, reservation_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        scope.hash(&mut hasher);
        reservation_id.hash(&mut hasher);
        let stripe = hasher.finish() as usize % self.reservation_locks.len();
        &self.reservation_locks[stripe]
    }

    fn existing_lease(&self, scope: PoolScope, owner_id: u64, reservation_id: &str) -> Option<PoolEntry> {
        let filter = EntryFilter {
            state: Some(EntryState::Taken),
            owner_id: Some(owner_id),
            reservation_id: Some(reservation_id.to_string()),
            ..Default::default()
        };
        self.store
            .scan(scope, &filter)
            .into_iter()
            .find(|e| e.is_leased_to(owner_id, reservation_id))
    }
}

/// Uniform random pick, preferring ids not tried yet
fn pick_candidate(free: &[EntryId], tried: &HashSet<EntryId>) -> Option<EntryId> {
    let mut rng = rand::thread_rng();
    let untried: Vec<EntryId> = free.iter().copied().filter(|id| !tried.contains(id)).collect();
    if untried.is_empty() {
        free.choose(&mut rng).copied()
    } else {
        untried.choose(&mut rng).copied()
    }
}

/// Narrowest scan that covers every row a key can match
fn release_filter(key: &ReleaseKey) -> EntryFilter {
    let mut filter = EntryFilter::taken();
    match key {
        ReleaseKey::Value { value, .. } => filter.value = Some(value.clone()),
        ReleaseKey::Owner { owner_id } => filter.owner_id = Some(*owner_id),
        ReleaseKey::Reservation { reservation_id } => {
            filter.reservation_id = Some(reservation_id.clone())
        }
    }
    filter
}
