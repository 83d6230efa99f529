//! Domain Ports - Core types and trait definitions for the pool allocator
//!
//! These traits define the boundaries between the allocation logic and the
//! durable state it runs over. Stores implement these traits to provide
//! concrete functionality.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Identifiers
// =============================================================================

/// Zone or pod identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ScopeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Store-wide row identifier, stable for the row's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Pool Kinds
// =============================================================================

/// Level a pool is partitioned by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Zone,
    Pod,
}

impl std::fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeLevel::Zone => write!(f, "zone"),
            ScopeLevel::Pod => write!(f, "pod"),
        }
    }
}

/// Kind of allocatable unit; one table per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// VXLAN/VNET segment id, zone scoped
    VnetSegment,
    /// VLAN tag, pod scoped
    PodVlan,
    /// Tenant-routable private IPv4, pod scoped
    PrivateIp,
    /// Control-plane link-local IPv4, pod scoped
    LinkLocalIp,
}

impl PoolKind {
    pub const ALL: [PoolKind; 4] = [
        PoolKind::VnetSegment,
        PoolKind::PodVlan,
        PoolKind::PrivateIp,
        PoolKind::LinkLocalIp,
    ];

    /// Scope level this kind is partitioned by
    pub fn scope_level(&self) -> ScopeLevel {
        match self {
            PoolKind::VnetSegment => ScopeLevel::Zone,
            PoolKind::PodVlan | PoolKind::PrivateIp | PoolKind::LinkLocalIp => ScopeLevel::Pod,
        }
    }

    /// Whether values are dotted IPv4 addresses (inclusive ranges, instance owners)
    pub fn is_ip(&self) -> bool {
        matches!(self, PoolKind::PrivateIp | PoolKind::LinkLocalIp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::VnetSegment => "vnet-segment",
            PoolKind::PodVlan => "pod-vlan",
            PoolKind::PrivateIp => "private-ip",
            PoolKind::LinkLocalIp => "link-local-ip",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vnet-segment" | "vnet" | "vxlan" => Ok(PoolKind::VnetSegment),
            "pod-vlan" | "vlan" => Ok(PoolKind::PodVlan),
            "private-ip" => Ok(PoolKind::PrivateIp),
            "link-local-ip" | "link-local" => Ok(PoolKind::LinkLocalIp),
            other => Err(crate::error::Error::Configuration(format!(
                "Unknown pool kind: {}",
                other
            ))),
        }
    }
}

/// A single pool: one kind within one zone or pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolScope {
    pub kind: PoolKind,
    pub scope_id: ScopeId,
}

impl PoolScope {
    pub fn new(kind: PoolKind, scope_id: impl Into<ScopeId>) -> Self {
        Self {
            kind,
            scope_id: scope_id.into(),
        }
    }
}

impl std::fmt::Display for PoolScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.scope_id)
    }
}

// =============================================================================
// Pool Entry
// =============================================================================

/// Allocation state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Free,
    Taken,
}

/// One allocatable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: EntryId,
    pub scope_id: ScopeId,
    pub kind: PoolKind,
    /// VLAN/VXLAN tag or dotted IPv4 address
    pub value: String,
    /// `None` while free
    pub taken_at: Option<DateTime<Utc>>,
    /// Account id for segment pools, instance id for IP pools
    pub owner_id: Option<u64>,
    pub reservation_id: Option<String>,
}

impl PoolEntry {
    /// Create a free entry
    pub fn new(id: EntryId, scope: PoolScope, value: impl Into<String>) -> Self {
        Self {
            id,
            scope_id: scope.scope_id,
            kind: scope.kind,
            value: value.into(),
            taken_at: None,
            owner_id: None,
            reservation_id: None,
        }
    }

    pub fn scope(&self) -> PoolScope {
        PoolScope::new(self.kind, self.scope_id)
    }

    pub fn state(&self) -> EntryState {
        if self.taken_at.is_some() {
            EntryState::Taken
        } else {
            EntryState::Free
        }
    }

    pub fn is_free(&self) -> bool {
        self.state() == EntryState::Free
    }

    /// Free → Taken
    pub fn mark_taken(&mut self, request: &LeaseRequest) {
        self.taken_at = Some(Utc::now());
        self.owner_id = Some(request.owner_id);
        self.reservation_id = request.reservation_id.clone();
    }

    /// Taken → Free
    pub fn mark_free(&mut self) {
        self.taken_at = None;
        self.owner_id = None;
        self.reservation_id = None;
    }

    /// Whether this entry is held by `owner_id` under `reservation_id`
    pub fn is_leased_to(&self, owner_id: u64, reservation_id: &str) -> bool {
        !self.is_free()
            && self.owner_id == Some(owner_id)
            && self.reservation_id.as_deref() == Some(reservation_id)
    }

    /// Check the free/owner invariant for this entry's kind
    pub fn is_consistent(&self) -> bool {
        let free = self.taken_at.is_none();
        if self.kind.is_ip() {
            free == (self.owner_id.is_none() && self.reservation_id.is_none())
        } else {
            free == self.owner_id.is_none()
        }
    }
}

// =============================================================================
// Lease Requests
// =============================================================================

/// Request to take an entry from a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Account id (segment pools) or instance id (IP pools)
    pub owner_id: u64,
    /// Token making retries of the same lease idempotent
    pub reservation_id: Option<String>,
}

impl LeaseRequest {
    pub fn new(owner_id: u64) -> Self {
        Self {
            owner_id,
            reservation_id: None,
        }
    }

    pub fn with_reservation(mut self, reservation_id: impl Into<String>) -> Self {
        self.reservation_id = Some(reservation_id.into());
        self
    }
}

/// Selects which taken entries a release applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseKey {
    /// One value, optionally guarded by the expected owner and reservation
    Value {
        value: String,
        owner_id: Option<u64>,
        reservation_id: Option<String>,
    },
    /// Everything an owner holds in the scope
    Owner { owner_id: u64 },
    /// Whatever was leased under a reservation token
    Reservation { reservation_id: String },
}

impl ReleaseKey {
    pub fn value(value: impl Into<String>) -> Self {
        ReleaseKey::Value {
            value: value.into(),
            owner_id: None,
            reservation_id: None,
        }
    }

    /// Whether a taken entry is covered by this key
    pub fn matches(&self, entry: &PoolEntry) -> bool {
        if entry.is_free() {
            return false;
        }
        match self {
            ReleaseKey::Value {
                value,
                owner_id,
                reservation_id,
            } => {
                entry.value == *value
                    && owner_id.map_or(true, |o| entry.owner_id == Some(o))
                    && reservation_id
                        .as_deref()
                        .map_or(true, |r| entry.reservation_id.as_deref() == Some(r))
            }
            ReleaseKey::Owner { owner_id } => entry.owner_id == Some(*owner_id),
            ReleaseKey::Reservation { reservation_id } => {
                entry.reservation_id.as_deref() == Some(reservation_id.as_str())
            }
        }
    }
}

impl std::fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseKey::Value { value, .. } => write!(f, "value={}", value),
            ReleaseKey::Owner { owner_id } => write!(f, "owner={}", owner_id),
            ReleaseKey::Reservation { reservation_id } => {
                write!(f, "reservation={}", reservation_id)
            }
        }
    }
}

/// Result of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Entries that went Taken → Free
    Released(Vec<PoolEntry>),
    /// Nothing taken matched the key
    NotAllocated,
}

impl ReleaseOutcome {
    pub fn released_count(&self) -> usize {
        match self {
            ReleaseOutcome::Released(entries) => entries.len(),
            ReleaseOutcome::NotAllocated => 0,
        }
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Filter for snapshot scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub state: Option<EntryState>,
    pub value: Option<String>,
    pub owner_id: Option<u64>,
    pub reservation_id: Option<String>,
}

impl EntryFilter {
    pub fn taken() -> Self {
        Self {
            state: Some(EntryState::Taken),
            ..Default::default()
        }
    }

    pub fn free() -> Self {
        Self {
            state: Some(EntryState::Free),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &PoolEntry) -> bool {
        self.state.map_or(true, |s| entry.state() == s)
            && self.value.as_deref().map_or(true, |v| entry.value == v)
            && self.owner_id.map_or(true, |o| entry.owner_id == Some(o))
            && self
                .reservation_id
                .as_deref()
                .map_or(true, |r| entry.reservation_id.as_deref() == Some(r))
    }
}

/// Row counts of one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub total: usize,
    pub taken: usize,
}

impl PoolCounts {
    pub fn free(&self) -> usize {
        self.total.saturating_sub(self.taken)
    }
}

/// Outcome of a row transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowUpdate {
    /// The mutation was applied and committed
    Committed(PoolEntry),
    /// The mutation declined; row left untouched
    Unchanged(PoolEntry),
}

/// Transactional table of pool rows with row-scoped exclusive locks
///
/// Implementations must make `insert_batch` and `delete_scope` all-or-nothing
/// and must never hold a pool-wide lock while waiting on a row lock.
pub trait PoolStore: Send + Sync {
    /// Insert free rows for `values`; fails without inserting anything on a duplicate
    fn insert_batch(&self, scope: PoolScope, values: Vec<String>) -> Result<usize>;

    /// Remove every row of a pool
    ///
    /// With `allow_taken == false` this fails with `ScopeInUse` and removes
    /// nothing if any row is taken. A row held longer than `lock_wait` fails
    /// the delete with `LockTimeout`, also removing nothing. Returns the
    /// removed rows.
    fn delete_scope(
        &self,
        scope: PoolScope,
        allow_taken: bool,
        lock_wait: Duration,
    ) -> Result<Vec<PoolEntry>>;

    /// Ids of rows currently observed free; may be stale by the time they are locked
    fn free_ids(&self, scope: PoolScope) -> Vec<EntryId>;

    /// Lock one row (waiting at most `lock_wait`) and run `apply` on a copy
    ///
    /// The copy is committed only if `apply` returns true.
    fn update_row(
        &self,
        scope: PoolScope,
        id: EntryId,
        lock_wait: Duration,
        apply: &mut dyn FnMut(&mut PoolEntry) -> bool,
    ) -> Result<RowUpdate>;

    /// Snapshot read of the rows matching `filter`, ordered by id
    fn scan(&self, scope: PoolScope, filter: &EntryFilter) -> Vec<PoolEntry>;

    /// Row counts for a pool
    fn counts(&self, scope: PoolScope) -> PoolCounts;

    /// Every pool with at least one row
    fn scopes(&self) -> Vec<PoolScope>;
}

// =============================================================================
// Sequence Port
// =============================================================================

/// Durable named counter
pub trait SequenceCounter: Send + Sync {
    /// Return the current value and advance it by one atomically
    fn next(&self, name: &str) -> Result<u64>;

    /// Value the next call to `next` would return, without advancing
    fn peek(&self, name: &str) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: PoolKind) -> PoolEntry {
        PoolEntry::new(EntryId(1), PoolScope::new(kind, 3), "10.0.0.1")
    }

    #[test]
    fn test_pool_kind_levels() {
        assert_eq!(PoolKind::VnetSegment.scope_level(), ScopeLevel::Zone);
        assert_eq!(PoolKind::PodVlan.scope_level(), ScopeLevel::Pod);
        assert!(PoolKind::LinkLocalIp.is_ip());
        assert!(!PoolKind::PodVlan.is_ip());
        assert_eq!("vlan".parse::<PoolKind>().unwrap(), PoolKind::PodVlan);
        assert!("ipv6".parse::<PoolKind>().is_err());
    }

    #[test]
    fn test_entry_transitions_keep_invariant() {
        let mut e = entry(PoolKind::PrivateIp);
        assert!(e.is_free());
        assert!(e.is_consistent());

        e.mark_taken(&LeaseRequest::new(42).with_reservation("r-1"));
        assert_eq!(e.state(), EntryState::Taken);
        assert!(e.is_consistent());
        assert!(e.is_leased_to(42, "r-1"));
        assert!(!e.is_leased_to(42, "r-2"));

        e.mark_free();
        assert!(e.is_free());
        assert!(e.is_consistent());
    }

    #[test]
    fn test_inconsistent_entries_detected() {
        let mut ip = entry(PoolKind::PrivateIp);
        ip.reservation_id = Some("dangling".into());
        assert!(!ip.is_consistent());

        let mut vlan = entry(PoolKind::PodVlan);
        vlan.taken_at = Some(Utc::now());
        assert!(!vlan.is_consistent());
    }

    #[test]
    fn test_release_key_matching() {
        let mut e = entry(PoolKind::PrivateIp);
        assert!(!ReleaseKey::value("10.0.0.1").matches(&e));

        e.mark_taken(&LeaseRequest::new(9).with_reservation("res"));
        assert!(ReleaseKey::value("10.0.0.1").matches(&e));
        assert!(ReleaseKey::Owner { owner_id: 9 }.matches(&e));
        assert!(!ReleaseKey::Owner { owner_id: 10 }.matches(&e));
        assert!(ReleaseKey::Reservation {
            reservation_id: "res".into()
        }
        .matches(&e));

        let guarded = ReleaseKey::Value {
            value: "10.0.0.1".into(),
            owner_id: Some(11),
            reservation_id: None,
        };
        assert!(!guarded.matches(&e));
    }
}
