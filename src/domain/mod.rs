//! Domain layer - Core pool types and port definitions
//!
//! This module defines the core traits (ports) that stores implement,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
