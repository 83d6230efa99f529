//! MAC Address Generation
//!
//! Sequence-backed generation of MAC address pairs:
//! - `address`: 48-bit address type and its bit layout
//! - `generator`: packing of sequence, zone and random bits into pairs

pub mod address;
pub mod generator;

pub use address::{MacAddress, MacPair};
pub use generator::{compose_mac_pair, validate_mask, MacSequenceGenerator, MAC_SEQUENCE_NAME};

/// Default administrative prefix byte (locally administered, unicast)
pub const DEFAULT_MAC_PREFIX: u8 = 0x06;

/// Largest sequence value that still fits the 32 low address bits
pub const MAX_MAC_SEQUENCE: u64 = u32::MAX as u64;
