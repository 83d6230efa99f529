//! MAC Sequence Generator
//!
//! Produces MAC address pairs from a durable counter without a pre-populated
//! pool. The bit packing lives in [`compose_mac_pair`] so it can be checked
//! with fixed inputs; the generator only supplies the counter value and the
//! random draw.

use super::address::{
    MacAddress, MacPair, MAC_ADDRESS_MASK, PAIR_MARKER_BIT, PREFIX_SHIFT, RANDOM_SHIFT,
    SCOPE_BITS_MASK, SCOPE_SHIFT,
};
use crate::config::MacGeneratorConfig;
use crate::domain::ports::{ScopeId, SequenceCounter};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Arc;
use tracing::{debug, error};

/// Counter name shared by every zone
pub const MAC_SEQUENCE_NAME: &str = "mac_address";

/// Pack one MAC pair
///
/// `addr = seq | prefix << 40 | (zone & 0x7f) << 32 | mask | random << 16`,
/// truncated to 48 bits; the secondary address adds bit 39.
pub fn compose_mac_pair(seq: u64, zone_id: ScopeId, mask: u64, prefix: u8, random: u16) -> MacPair {
    let addr = seq
        | ((prefix as u64) << PREFIX_SHIFT)
        | ((zone_id.0 & SCOPE_BITS_MASK) << SCOPE_SHIFT)
        | mask
        | ((random as u64) << RANDOM_SHIFT);
    MacPair::from_primary(MacAddress::new(addr))
}

/// Check a caller mask against the layout contract
pub fn validate_mask(mask: u64) -> Result<()> {
    if mask & !MAC_ADDRESS_MASK != 0 || mask & (1 << PAIR_MARKER_BIT) != 0 {
        return Err(Error::InvalidMacMask { mask });
    }
    Ok(())
}

/// Generates MAC pairs over a [`SequenceCounter`]
pub struct MacSequenceGenerator {
    counter: Arc<dyn SequenceCounter>,
    config: MacGeneratorConfig,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl std::fmt::Debug for MacSequenceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacSequenceGenerator")
            .field("config", &self.config)
            .finish()
    }
}

impl MacSequenceGenerator {
    /// Create a generator seeded from OS entropy
    pub fn new(counter: Arc<dyn SequenceCounter>, config: MacGeneratorConfig) -> Self {
        Self::with_rng(counter, config, StdRng::from_entropy())
    }

    /// Create a generator with a caller-supplied random source
    pub fn with_rng(
        counter: Arc<dyn SequenceCounter>,
        config: MacGeneratorConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        Self {
            counter,
            config,
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Generate the next pair for a zone
    pub fn generate_pair(&self, zone_id: ScopeId, mask: u64) -> Result<MacPair> {
        validate_mask(mask)?;

        let seq = self.counter.next(MAC_SEQUENCE_NAME)?;
        if seq > self.config.max_sequence {
            error!(
                "MAC sequence exhausted: {} exceeds budget {}",
                seq, self.config.max_sequence
            );
            return Err(Error::SequenceExhausted {
                name: MAC_SEQUENCE_NAME.to_string(),
                value: seq,
            });
        }
        if zone_id.0 > SCOPE_BITS_MASK {
            debug!(
                "Zone {} truncated to {} in MAC layout",
                zone_id,
                zone_id.0 & SCOPE_BITS_MASK
            );
        }

        let random: u16 = self.rng.lock().gen();
        let pair = compose_mac_pair(seq, zone_id, mask, self.config.prefix, random);
        debug!("Generated MAC pair {} for zone {} (seq {})", pair, zone_id, seq);
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySequenceCounter;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    fn generator(seed: u64) -> MacSequenceGenerator {
        MacSequenceGenerator::with_rng(
            MemorySequenceCounter::new(),
            MacGeneratorConfig::default(),
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn test_compose_known_layout() {
        let pair = compose_mac_pair(1, ScopeId(7), 0, 0x06, 0x1234);
        assert_eq!(pair.primary.to_string(), "06:07:12:34:00:01");
        assert_eq!(pair.secondary.to_string(), "06:87:12:34:00:01");
    }

    #[test]
    fn test_compose_is_pure() {
        for seq in [1u64, 2, 0xffff, 0x1_0000, 0xffff_ffff] {
            let a = compose_mac_pair(seq, ScopeId(3), 0x0f00, 0x06, 0xbeef);
            let b = compose_mac_pair(seq, ScopeId(3), 0x0f00, 0x06, 0xbeef);
            assert_eq!(a, b);
            assert_eq!(a.primary.as_u64() ^ a.secondary.as_u64(), 1 << PAIR_MARKER_BIT);
        }
    }

    #[test]
    fn test_compose_embeds_zone_and_prefix() {
        let pair = compose_mac_pair(42, ScopeId(200), 0, 0x0a, 0);
        assert_eq!(pair.primary.scope_bits(), 200 & 0x7f);
        assert_eq!(pair.primary.prefix(), 0x0a);
        assert_eq!(pair.primary.sequence_bits(), 42);
        assert!(!pair.primary.is_pair_secondary());
    }

    #[test]
    fn test_mask_validation() {
        validate_mask(0).unwrap();
        validate_mask(0xff).unwrap();
        assert_matches!(validate_mask(1 << 39), Err(Error::InvalidMacMask { .. }));
        assert_matches!(validate_mask(1 << 48), Err(Error::InvalidMacMask { .. }));
    }

    #[test]
    fn test_seeded_generators_agree() {
        let a = generator(17);
        let b = generator(17);
        for _ in 0..16 {
            assert_eq!(
                a.generate_pair(ScopeId(5), 0).unwrap(),
                b.generate_pair(ScopeId(5), 0).unwrap()
            );
        }
    }

    #[test]
    fn test_sequence_drives_low_bits() {
        let gen = generator(1);
        let first = gen.generate_pair(ScopeId(1), 0).unwrap();
        let second = gen.generate_pair(ScopeId(1), 0).unwrap();
        assert_eq!(first.primary.sequence_bits(), 1);
        assert_eq!(second.primary.sequence_bits(), 2);
    }

    #[test]
    fn test_pairs_are_distinct() {
        let gen = generator(99);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let pair = gen.generate_pair(ScopeId(9), 0).unwrap();
            assert!(seen.insert(pair.primary));
            assert!(seen.insert(pair.secondary));
        }
    }

    #[test]
    fn test_sequence_budget_fails_loudly() {
        let config = MacGeneratorConfig {
            max_sequence: 2,
            ..Default::default()
        };
        let gen = MacSequenceGenerator::with_rng(
            MemorySequenceCounter::new(),
            config,
            StdRng::seed_from_u64(0),
        );
        gen.generate_pair(ScopeId(1), 0).unwrap();
        gen.generate_pair(ScopeId(1), 0).unwrap();
        assert_matches!(
            gen.generate_pair(ScopeId(1), 0),
            Err(Error::SequenceExhausted { value: 3, .. })
        );
    }

    #[test]
    fn test_invalid_mask_does_not_consume_sequence() {
        let counter = MemorySequenceCounter::new();
        let gen = MacSequenceGenerator::with_rng(
            counter.clone(),
            MacGeneratorConfig::default(),
            StdRng::seed_from_u64(0),
        );
        assert!(gen.generate_pair(ScopeId(1), 1 << 39).is_err());
        assert_eq!(counter.peek(MAC_SEQUENCE_NAME), 1);
    }
}
