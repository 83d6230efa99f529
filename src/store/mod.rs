//! Pool Store Module
//!
//! Row-locked pool tables, named sequence counters and the snapshot file
//! that makes both durable.

pub mod memory;
pub mod sequence;
pub mod snapshot;

pub use memory::{MemoryPoolStore, TableStats};
pub use sequence::{MemorySequenceCounter, SEQUENCE_START};
pub use snapshot::{PoolSnapshot, SnapshotFile, StateLock, SNAPSHOT_VERSION};
