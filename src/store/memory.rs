//! In-Memory Pool Store
//!
//! Transactional row table with one `parking_lot::Mutex` per row. The row map
//! of each pool sits behind an `RwLock` that is taken exclusively only by
//! range insertion and deletion; takes, releases and reads share it and
//! never wait on a row lock while holding it.

use crate::domain::ports::{
    EntryFilter, EntryId, PoolCounts, PoolEntry, PoolScope, PoolStore, RowUpdate,
};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug)]
struct RowCell {
    entry: PoolEntry,
    /// Set once the row is deleted; a holder of a stale handle must not commit
    removed: bool,
}

#[derive(Debug)]
struct Row {
    /// Lock-free mirror of `cell.entry.state()` for candidate listing
    taken: AtomicBool,
    cell: Mutex<RowCell>,
}

impl Row {
    fn new(entry: PoolEntry) -> Self {
        Self {
            taken: AtomicBool::new(!entry.is_free()),
            cell: Mutex::new(RowCell {
                entry,
                removed: false,
            }),
        }
    }
}

// =============================================================================
// Table Statistics
// =============================================================================

/// Statistics for a single pool table
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct TableStats {
    /// Rows currently taken
    pub taken: AtomicU64,
    /// Committed row and batch mutations
    pub update_count: AtomicU64,
    /// Row lock waits that timed out
    pub lock_timeouts: AtomicU64,
}

// =============================================================================
// Pool Table
// =============================================================================

#[derive(Debug, Default)]
struct TableRows {
    by_id: BTreeMap<EntryId, Arc<Row>>,
    by_value: HashMap<String, EntryId>,
}

#[derive(Debug, Default)]
struct PoolTable {
    rows: RwLock<TableRows>,
    stats: TableStats,
}

impl PoolTable {
    fn row(&self, id: EntryId) -> Option<Arc<Row>> {
        self.rows.read().by_id.get(&id).cloned()
    }

    fn all_rows(&self) -> Vec<Arc<Row>> {
        self.rows.read().by_id.values().cloned().collect()
    }
}

// =============================================================================
// Memory Pool Store
// =============================================================================

/// Pool store backed by per-row mutexes
///
/// Tables are created on first insert and never dropped from the map, so a
/// concurrent insert can never land in a detached table.
#[derive(Debug)]
pub struct MemoryPoolStore {
    tables: DashMap<PoolScope, Arc<PoolTable>>,
    next_id: AtomicU64,
}

impl MemoryPoolStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::empty())
    }

    fn empty() -> Self {
        Self {
            tables: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild a store from persisted rows
    pub fn from_entries(entries: Vec<PoolEntry>, next_entry_id: u64) -> Result<Arc<Self>> {
        let store = Self::empty();
        let mut max_id = 0u64;
        let mut seen_ids = HashSet::with_capacity(entries.len());

        for entry in entries {
            if !entry.is_consistent() {
                return Err(Error::Snapshot(format!(
                    "Entry {} ({}) violates the owner invariant",
                    entry.id,
                    entry.scope()
                )));
            }
            if !seen_ids.insert(entry.id) {
                return Err(Error::Snapshot(format!("Duplicate entry id {}", entry.id)));
            }
            max_id = max_id.max(entry.id.0);

            let scope = entry.scope();
            let table = store.table_or_create(scope);
            let mut rows = table.rows.write();
            if rows.by_value.contains_key(&entry.value) {
                return Err(Error::DuplicateValue {
                    scope,
                    value: entry.value,
                });
            }
            if !entry.is_free() {
                table.stats.taken.fetch_add(1, Ordering::Relaxed);
            }
            rows.by_value.insert(entry.value.clone(), entry.id);
            rows.by_id.insert(entry.id, Arc::new(Row::new(entry)));
        }

        store
            .next_id
            .store(next_entry_id.max(max_id + 1), Ordering::SeqCst);
        Ok(Arc::new(store))
    }

    /// All rows across all pools, ordered by scope then id
    pub fn entries(&self) -> Vec<PoolEntry> {
        let mut scopes = self.scopes();
        scopes.sort();
        scopes
            .into_iter()
            .flat_map(|scope| self.scan(scope, &EntryFilter::default()))
            .collect()
    }

    /// Id the next inserted row will receive
    pub fn next_entry_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Row lock timeouts observed on a pool
    pub fn lock_timeouts(&self, scope: PoolScope) -> u64 {
        self.table(scope)
            .map(|t| t.stats.lock_timeouts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn table(&self, scope: PoolScope) -> Option<Arc<PoolTable>> {
        self.tables.get(&scope).map(|t| t.value().clone())
    }

    fn table_or_create(&self, scope: PoolScope) -> Arc<PoolTable> {
        self.tables
            .entry(scope)
            .or_insert_with(|| Arc::new(PoolTable::default()))
            .value()
            .clone()
    }
}

impl Default for MemoryPoolStore {
    fn default() -> Self {
        Self::empty()
    }
}

enum Tombstone {
    Deleted(Vec<PoolEntry>),
    /// A row lock was held elsewhere; nothing was changed
    Busy(EntryId, Arc<Row>),
}

/// One non-blocking pass over a table under its write lock
///
/// Row guards are held until the pass ends, so a busy or refused row undoes
/// the tombstones without locking anything again.
fn try_tombstone_all(table: &PoolTable, scope: PoolScope, allow_taken: bool) -> Result<Tombstone> {
    let mut rows = table.rows.write();

    let mut held = Vec::with_capacity(rows.by_id.len());
    let mut outcome = None;
    for (id, row) in rows.by_id.iter() {
        let mut cell = match row.cell.try_lock() {
            Some(cell) => cell,
            None => {
                outcome = Some(Ok(Tombstone::Busy(*id, row.clone())));
                break;
            }
        };
        if !allow_taken && !cell.entry.is_free() {
            let taken = rows
                .by_id
                .values()
                .filter(|r| r.taken.load(Ordering::Acquire))
                .count();
            outcome = Some(Err(Error::ScopeInUse { scope, taken }));
            break;
        }
        cell.removed = true;
        held.push(cell);
    }

    if let Some(outcome) = outcome {
        for cell in held.iter_mut() {
            cell.removed = false;
        }
        return outcome;
    }
    let removed: Vec<PoolEntry> = held.iter().map(|cell| cell.entry.clone()).collect();
    drop(held);

    rows.by_id.clear();
    rows.by_value.clear();
    table.stats.taken.store(0, Ordering::Relaxed);
    table.stats.update_count.fetch_add(1, Ordering::Relaxed);
    Ok(Tombstone::Deleted(removed))
}

impl PoolStore for MemoryPoolStore {
    fn insert_batch(&self, scope: PoolScope, values: Vec<String>) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }

        let table = self.table_or_create(scope);
        let mut rows = table.rows.write();

        // Validate the whole batch before touching the table
        let mut batch = HashSet::with_capacity(values.len());
        for value in &values {
            if rows.by_value.contains_key(value) || !batch.insert(value.as_str()) {
                return Err(Error::DuplicateValue {
                    scope,
                    value: value.clone(),
                });
            }
        }

        let count = values.len();
        let first = self.next_id.fetch_add(count as u64, Ordering::SeqCst);
        for (offset, value) in values.into_iter().enumerate() {
            let id = EntryId(first + offset as u64);
            rows.by_value.insert(value.clone(), id);
            rows.by_id
                .insert(id, Arc::new(Row::new(PoolEntry::new(id, scope, value))));
        }
        table.stats.update_count.fetch_add(1, Ordering::Relaxed);

        debug!("Inserted {} rows into {}", count, scope);
        Ok(count)
    }

    fn delete_scope(
        &self,
        scope: PoolScope,
        allow_taken: bool,
        lock_wait: Duration,
    ) -> Result<Vec<PoolEntry>> {
        let table = match self.table(scope) {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        let deadline = Instant::now() + lock_wait;

        loop {
            let (busy_id, busy_row) = match try_tombstone_all(&table, scope, allow_taken)? {
                Tombstone::Deleted(removed) => {
                    debug!("Deleted {} rows from {}", removed.len(), scope);
                    return Ok(removed);
                }
                Tombstone::Busy(id, row) => (id, row),
            };

            // Map lock is released here; wait for the busy row, then retry
            let remaining = deadline.saturating_duration_since(Instant::now());
            if busy_row.cell.try_lock_for(remaining).is_none() {
                table.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::LockTimeout {
                    scope,
                    entry_id: busy_id,
                });
            }
            trace!("Row {} in {} released, retrying delete", busy_id, scope);
        }
    }

    fn free_ids(&self, scope: PoolScope) -> Vec<EntryId> {
        match self.table(scope) {
            Some(table) => table
                .rows
                .read()
                .by_id
                .iter()
                .filter(|(_, row)| !row.taken.load(Ordering::Acquire))
                .map(|(id, _)| *id)
                .collect(),
            None => Vec::new(),
        }
    }

    fn update_row(
        &self,
        scope: PoolScope,
        id: EntryId,
        lock_wait: Duration,
        apply: &mut dyn FnMut(&mut PoolEntry) -> bool,
    ) -> Result<RowUpdate> {
        let not_found = || Error::EntryNotFound {
            scope,
            entry_id: id,
        };
        let table = self.table(scope).ok_or_else(not_found)?;
        // Map lock is released here, before waiting on the row
        let row = table.row(id).ok_or_else(not_found)?;

        let mut cell = match row.cell.try_lock_for(lock_wait) {
            Some(cell) => cell,
            None => {
                table.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::LockTimeout {
                    scope,
                    entry_id: id,
                });
            }
        };
        if cell.removed {
            return Err(not_found());
        }

        let mut draft = cell.entry.clone();
        if !apply(&mut draft) {
            return Ok(RowUpdate::Unchanged(cell.entry.clone()));
        }

        if draft.id != cell.entry.id
            || draft.value != cell.entry.value
            || draft.scope() != cell.entry.scope()
        {
            return Err(Error::Internal(format!(
                "Row {} in {} attempted to change its identity",
                id, scope
            )));
        }
        if !draft.is_consistent() {
            return Err(Error::Internal(format!(
                "Row {} in {} would violate the owner invariant",
                id, scope
            )));
        }

        let was_taken = !cell.entry.is_free();
        let now_taken = !draft.is_free();
        cell.entry = draft;
        row.taken.store(now_taken, Ordering::Release);
        match (was_taken, now_taken) {
            (false, true) => {
                table.stats.taken.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                table.stats.taken.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        table.stats.update_count.fetch_add(1, Ordering::Relaxed);

        trace!("Committed row {} in {}", id, scope);
        Ok(RowUpdate::Committed(cell.entry.clone()))
    }

    fn scan(&self, scope: PoolScope, filter: &EntryFilter) -> Vec<PoolEntry> {
        let table = match self.table(scope) {
            Some(t) => t,
            None => return Vec::new(),
        };

        let rows = match filter.value.as_deref() {
            Some(value) => {
                let guard = table.rows.read();
                guard
                    .by_value
                    .get(value)
                    .and_then(|id| guard.by_id.get(id).cloned())
                    .into_iter()
                    .collect()
            }
            None => table.all_rows(),
        };

        rows.iter()
            .filter_map(|row| {
                let cell = row.cell.lock();
                if !cell.removed && filter.matches(&cell.entry) {
                    Some(cell.entry.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn counts(&self, scope: PoolScope) -> PoolCounts {
        match self.table(scope) {
            Some(table) => {
                let total = table.rows.read().by_id.len();
                let taken = table.stats.taken.load(Ordering::Relaxed) as usize;
                PoolCounts { total, taken }
            }
            None => PoolCounts::default(),
        }
    }

    fn scopes(&self) -> Vec<PoolScope> {
        self.tables
            .iter()
            .filter(|t| !t.value().rows.read().by_id.is_empty())
            .map(|t| *t.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{LeaseRequest, PoolKind};
    use assert_matches::assert_matches;
    use std::sync::mpsc;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(50);

    fn vlan_scope() -> PoolScope {
        PoolScope::new(PoolKind::PodVlan, 1)
    }

    fn values(range: std::ops::Range<u32>) -> Vec<String> {
        range.map(|v| v.to_string()).collect()
    }

    fn take(store: &MemoryPoolStore, scope: PoolScope, id: EntryId, owner: u64) -> Result<RowUpdate> {
        let request = LeaseRequest::new(owner);
        store.update_row(scope, id, WAIT, &mut |e| {
            if e.is_free() {
                e.mark_taken(&request);
                true
            } else {
                false
            }
        })
    }

    #[test]
    fn test_insert_and_count() {
        let store = MemoryPoolStore::new();
        assert_eq!(store.insert_batch(vlan_scope(), values(10..20)).unwrap(), 10);

        let counts = store.counts(vlan_scope());
        assert_eq!(counts.total, 10);
        assert_eq!(counts.taken, 0);
        assert_eq!(counts.free(), 10);
        assert_eq!(store.free_ids(vlan_scope()).len(), 10);
        assert_eq!(store.scopes(), vec![vlan_scope()]);
    }

    #[test]
    fn test_duplicate_in_batch_inserts_nothing() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), vec!["15".into()]).unwrap();

        let result = store.insert_batch(vlan_scope(), values(10..20));
        assert_matches!(result, Err(Error::DuplicateValue { ref value, .. }) if value == "15");
        assert_eq!(store.counts(vlan_scope()).total, 1);

        let other = PoolScope::new(PoolKind::PodVlan, 2);
        let result = store.insert_batch(other, vec!["1".into(), "2".into(), "1".into()]);
        assert_matches!(result, Err(Error::DuplicateValue { .. }));
        assert_eq!(store.counts(other).total, 0);
        assert!(store.scopes().iter().all(|s| *s != other));
    }

    #[test]
    fn test_same_value_in_different_scopes() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..3)).unwrap();
        store
            .insert_batch(PoolScope::new(PoolKind::PodVlan, 2), values(1..3))
            .unwrap();
        store
            .insert_batch(PoolScope::new(PoolKind::VnetSegment, 1), values(1..3))
            .unwrap();
        assert_eq!(store.scopes().len(), 3);
    }

    #[test]
    fn test_update_row_commit_and_decline() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..2)).unwrap();
        let id = store.free_ids(vlan_scope())[0];

        assert_matches!(take(&store, vlan_scope(), id, 7), Ok(RowUpdate::Committed(e)) if e.owner_id == Some(7));
        assert_matches!(take(&store, vlan_scope(), id, 8), Ok(RowUpdate::Unchanged(e)) if e.owner_id == Some(7));
        assert!(store.free_ids(vlan_scope()).is_empty());
        assert_eq!(store.counts(vlan_scope()).taken, 1);
    }

    #[test]
    fn test_update_row_rejects_inconsistent_commit() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..2)).unwrap();
        let id = store.free_ids(vlan_scope())[0];

        let result = store.update_row(vlan_scope(), id, WAIT, &mut |e| {
            e.owner_id = Some(1);
            true
        });
        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(store.counts(vlan_scope()).taken, 0);
    }

    #[test]
    fn test_lock_wait_is_bounded() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..2)).unwrap();
        let id = store.free_ids(vlan_scope())[0];

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .update_row(vlan_scope(), id, WAIT, &mut |_| {
                        locked_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(300));
                        false
                    })
                    .unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let result = take(&store, vlan_scope(), id, 1);
        assert_matches!(result, Err(Error::LockTimeout { entry_id, .. }) if entry_id == id);
        assert_eq!(store.lock_timeouts(vlan_scope()), 1);
        holder.join().unwrap();
    }

    #[test]
    fn test_delete_scope_guard() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..5)).unwrap();
        let id = store.free_ids(vlan_scope())[2];
        take(&store, vlan_scope(), id, 3).unwrap();

        let result = store.delete_scope(vlan_scope(), false, WAIT);
        assert_matches!(result, Err(Error::ScopeInUse { taken: 1, .. }));
        assert_eq!(store.counts(vlan_scope()).total, 4);

        // Rows must still be usable after a refused delete
        let free = store.free_ids(vlan_scope());
        assert_eq!(free.len(), 3);
        assert_matches!(take(&store, vlan_scope(), free[0], 4), Ok(RowUpdate::Committed(_)));

        let removed = store.delete_scope(vlan_scope(), true, WAIT).unwrap();
        assert_eq!(removed.len(), 4);
        assert_eq!(store.counts(vlan_scope()), PoolCounts::default());
        assert!(store.scopes().is_empty());
    }

    #[test]
    fn test_stale_handle_after_delete() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..2)).unwrap();
        let id = store.free_ids(vlan_scope())[0];
        store.delete_scope(vlan_scope(), false, WAIT).unwrap();

        assert_matches!(take(&store, vlan_scope(), id, 1), Err(Error::EntryNotFound { .. }));
    }

    /// Hold one row inside `update_row` until `release_rx` fires
    fn hold_row(
        store: &Arc<MemoryPoolStore>,
        id: EntryId,
        hold: Duration,
    ) -> (mpsc::Receiver<()>, thread::JoinHandle<()>) {
        let (locked_tx, locked_rx) = mpsc::channel();
        let store = store.clone();
        let holder = thread::spawn(move || {
            store
                .update_row(vlan_scope(), id, WAIT, &mut |_| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(hold);
                    false
                })
                .unwrap();
        });
        (locked_rx, holder)
    }

    #[test]
    fn test_delete_scope_wait_is_bounded() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..5)).unwrap();
        let held = store.free_ids(vlan_scope())[2];

        let (locked_rx, holder) = hold_row(&store, held, Duration::from_millis(400));
        locked_rx.recv().unwrap();

        let started = Instant::now();
        let result = store.delete_scope(vlan_scope(), true, WAIT);
        assert_matches!(result, Err(Error::LockTimeout { entry_id, .. }) if entry_id == held);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(store.lock_timeouts(vlan_scope()), 1);

        // Nothing was removed and readers were never shut out
        let started = Instant::now();
        assert_eq!(store.free_ids(vlan_scope()).len(), 4);
        assert_eq!(store.counts(vlan_scope()).total, 4);
        assert!(started.elapsed() < Duration::from_millis(100));

        holder.join().unwrap();
        let free = store.free_ids(vlan_scope());
        assert_matches!(take(&store, vlan_scope(), free[0], 1), Ok(RowUpdate::Committed(_)));
    }

    #[test]
    fn test_delete_scope_waits_out_short_hold() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..5)).unwrap();
        let held = store.free_ids(vlan_scope())[0];

        let (locked_rx, holder) = hold_row(&store, held, Duration::from_millis(100));
        locked_rx.recv().unwrap();

        let removed = store
            .delete_scope(vlan_scope(), false, Duration::from_secs(5))
            .unwrap();
        assert_eq!(removed.len(), 4);
        assert!(store.scopes().is_empty());
        holder.join().unwrap();
    }

    #[test]
    fn test_scan_filters() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..6)).unwrap();
        let ids = store.free_ids(vlan_scope());
        take(&store, vlan_scope(), ids[0], 10).unwrap();
        take(&store, vlan_scope(), ids[1], 10).unwrap();
        take(&store, vlan_scope(), ids[2], 11).unwrap();

        assert_eq!(store.scan(vlan_scope(), &EntryFilter::taken()).len(), 3);
        assert_eq!(store.scan(vlan_scope(), &EntryFilter::free()).len(), 2);

        let by_owner = EntryFilter {
            owner_id: Some(10),
            ..Default::default()
        };
        assert_eq!(store.scan(vlan_scope(), &by_owner).len(), 2);

        let by_value = EntryFilter {
            value: Some("3".into()),
            ..Default::default()
        };
        let found = store.scan(vlan_scope(), &by_value);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner_id, Some(11));
    }

    #[test]
    fn test_from_entries_round_trip() {
        let store = MemoryPoolStore::new();
        store.insert_batch(vlan_scope(), values(1..4)).unwrap();
        let id = store.free_ids(vlan_scope())[1];
        take(&store, vlan_scope(), id, 5).unwrap();

        let restored = MemoryPoolStore::from_entries(store.entries(), store.next_entry_id()).unwrap();
        assert_eq!(restored.entries(), store.entries());
        assert_eq!(restored.counts(vlan_scope()).taken, 1);
        assert_eq!(restored.next_entry_id(), store.next_entry_id());
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        let scope = vlan_scope();
        let entries = vec![
            PoolEntry::new(EntryId(1), scope, "5"),
            PoolEntry::new(EntryId(2), scope, "5"),
        ];
        assert_matches!(
            MemoryPoolStore::from_entries(entries, 3),
            Err(Error::DuplicateValue { .. })
        );
    }
}
