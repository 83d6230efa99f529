//! Allocation Module
//!
//! Provides range provisioning, take/release of pool entries, and read-only
//! pool queries.

pub mod allocator;
pub mod provisioner;
pub mod query;
pub mod range;

pub use allocator::*;
pub use provisioner::*;
pub use query::*;
pub use range::*;
