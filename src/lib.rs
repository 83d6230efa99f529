//! netpool - Network Resource Pool Allocator
//!
//! Hands out network identifiers from pre-provisioned pools: VXLAN/VNET
//! segments per zone, VLAN tags and private/link-local IPv4 addresses per
//! pod, plus sequence-generated MAC address pairs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               PoolService                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │      Range      │  │      Pool       │  │      MAC Sequence           │  │
//! │  │   Provisioner   │  │    Allocator    │  │      Generator              │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┤                         │                   │
//! │                                │                         │                   │
//! │                    ┌───────────┴───────────┐  ┌──────────┴──────────┐       │
//! │                    │      Pool Store       │  │  Sequence Counters  │       │
//! │                    │  (per-row locking)    │  │  (atomic, no wrap)  │       │
//! │                    └───────────────────────┘  └─────────────────────┘       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                         JSON Snapshot (durability)                           │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`allocation`]: Range provisioning, take/release and queries
//! - [`mac`]: MAC address layout and pair generation
//! - [`store`]: In-memory pool store, sequence counters and snapshots
//! - [`domain`]: Core domain types and traits
//! - [`config`]: Configuration loading and validation
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod allocation;
pub mod config;
pub mod domain;
pub mod error;
pub mod mac;
pub mod metrics;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use allocation::{PoolAllocator, PoolRange, PoolUsage, QueryService, RangeProvisioner};

pub use config::{AllocatorConfig, MacGeneratorConfig, NetpoolConfig, ProvisionerConfig};

pub use domain::ports::{
    EntryFilter, EntryId, EntryState, LeaseRequest, PoolEntry, PoolKind, PoolScope, PoolStore,
    ReleaseKey, ReleaseOutcome, ScopeId, ScopeLevel, SequenceCounter,
};

pub use error::{Error, ErrorAction, Result};

pub use mac::{MacAddress, MacPair, MacSequenceGenerator};

pub use metrics::PoolMetrics;

pub use service::PoolService;

pub use store::{MemoryPoolStore, MemorySequenceCounter, PoolSnapshot, SnapshotFile, StateLock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
