//! MAC Address Layout
//!
//! Generated addresses are 48-bit values with a fixed bit layout that
//! downstream systems rely on to read provenance back out of an address:
//!
//! ```text
//!  47        40 39 38       32 31                16 15                 0
//! ┌────────────┬──┬───────────┬────────────────────┬────────────────────┐
//! │   prefix   │P │  zone id  │ random | seq 16-31 │    seq bits 0-15   │
//! └────────────┴──┴───────────┴────────────────────┴────────────────────┘
//! ```
//!
//! `P` is the pair marker: clear on the primary address of a pair and set on
//! the secondary. The caller mask is OR-ed over the whole value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// All 48 address bits
pub const MAC_ADDRESS_MASK: u64 = 0xffff_ffff_ffff;

/// Shift of the administrative prefix byte
pub const PREFIX_SHIFT: u32 = 40;

/// Bit set on the second address of a pair
pub const PAIR_MARKER_BIT: u32 = 39;

/// Shift of the embedded zone id
pub const SCOPE_SHIFT: u32 = 32;

/// Width mask of the embedded zone id (bits 32-38)
pub const SCOPE_BITS_MASK: u64 = 0x7f;

/// Shift of the 16 random bits
pub const RANDOM_SHIFT: u32 = 16;

// =============================================================================
// MAC Address
// =============================================================================

/// A 48-bit MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddress(u64);

impl MacAddress {
    /// Build from the low 48 bits of `value`
    pub fn new(value: u64) -> Self {
        Self(value & MAC_ADDRESS_MASK)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn octets(&self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    /// Administrative prefix byte (bits 40-47)
    pub fn prefix(&self) -> u8 {
        (self.0 >> PREFIX_SHIFT) as u8
    }

    /// Embedded zone id (bits 32-38)
    pub fn scope_bits(&self) -> u8 {
        ((self.0 >> SCOPE_SHIFT) & SCOPE_BITS_MASK) as u8
    }

    /// Whether the pair marker bit is set
    pub fn is_pair_secondary(&self) -> bool {
        self.0 & (1 << PAIR_MARKER_BIT) != 0
    }

    /// Low 16 bits, taken from the sequence value
    pub fn sequence_bits(&self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl std::str::FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMacAddress(s.to_string());
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut value = 0u64;
        for part in parts {
            if part.len() != 2 {
                return Err(invalid());
            }
            let octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            value = (value << 8) | octet as u64;
        }
        Ok(Self(value))
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// =============================================================================
// MAC Pair
// =============================================================================

/// Two related addresses differing only in the pair marker bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacPair {
    pub primary: MacAddress,
    pub secondary: MacAddress,
}

impl MacPair {
    /// Derive the pair from the primary address
    pub fn from_primary(primary: MacAddress) -> Self {
        Self {
            primary,
            secondary: MacAddress::new(primary.as_u64() | (1 << PAIR_MARKER_BIT)),
        }
    }
}

impl std::fmt::Display for MacPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.primary, self.secondary)
    }
}
