//! Range Parsing
//!
//! Turns operator-supplied range bounds into the concrete values a pool is
//! provisioned with. Integer kinds use half-open `[start, end)` bounds; IP
//! kinds use inclusive `[start, end]` bounds over dotted IPv4 addresses.

use crate::domain::ports::PoolKind;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Largest 802.1Q VLAN id usable for pod traffic
pub const MAX_VLAN_ID: u32 = 4094;

/// Largest 24-bit VXLAN network identifier
pub const MAX_VNI: u32 = (1 << 24) - 1;

/// Parsed bounds of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBounds {
    /// `[start, end)`
    Integer { start: u32, end: u32 },
    /// `[start, end]`
    Ipv4 { start: Ipv4Addr, end: Ipv4Addr },
}

/// A validated range of pool values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    pub kind: PoolKind,
    pub bounds: RangeBounds,
}

impl PoolRange {
    /// Parse and validate range bounds for a pool kind
    pub fn parse(kind: PoolKind, start: &str, end: &str) -> Result<Self> {
        let bounds = if kind.is_ip() {
            let start = parse_ipv4(start)?;
            let end = parse_ipv4(end)?;
            if u32::from(end) < u32::from(start) {
                return Err(Error::InvalidRange(format!(
                    "{} range ends at {} before it starts at {}",
                    kind, end, start
                )));
            }
            if kind == PoolKind::LinkLocalIp {
                for addr in [start, end] {
                    if !addr.is_link_local() {
                        return Err(Error::InvalidRange(format!(
                            "{} is outside 169.254.0.0/16",
                            addr
                        )));
                    }
                }
            }
            RangeBounds::Ipv4 { start, end }
        } else {
            let start = parse_integer(start)?;
            let end = parse_integer(end)?;
            if end <= start {
                return Err(Error::InvalidRange(format!(
                    "{} range [{}, {}) is empty",
                    kind, start, end
                )));
            }
            let max = match kind {
                PoolKind::PodVlan => MAX_VLAN_ID,
                _ => MAX_VNI,
            };
            if start == 0 || end - 1 > max {
                return Err(Error::InvalidRange(format!(
                    "{} values must lie in 1..={}, got [{}, {})",
                    kind, max, start, end
                )));
            }
            RangeBounds::Integer { start, end }
        };

        Ok(Self { kind, bounds })
    }

    /// Number of values in the range
    pub fn len(&self) -> u64 {
        match self.bounds {
            RangeBounds::Integer { start, end } => (end - start) as u64,
            RangeBounds::Ipv4 { start, end } => (u32::from(end) - u32::from(start)) as u64 + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject ranges larger than `max_entries`
    pub fn check_size(&self, max_entries: u64) -> Result<()> {
        let len = self.len();
        if len > max_entries {
            return Err(Error::InvalidRange(format!(
                "{} range holds {} entries, limit is {}",
                self.kind, len, max_entries
            )));
        }
        Ok(())
    }

    /// Value strings in ascending order
    pub fn values(&self) -> Vec<String> {
        match self.bounds {
            RangeBounds::Integer { start, end } => (start..end).map(|v| v.to_string()).collect(),
            RangeBounds::Ipv4 { start, end } => (u32::from(start)..=u32::from(end))
                .map(|v| Ipv4Addr::from(v).to_string())
                .collect(),
        }
    }

    /// Whether `value` falls inside the range
    pub fn contains(&self, value: &str) -> bool {
        match self.bounds {
            RangeBounds::Integer { start, end } => value
                .parse::<u32>()
                .map_or(false, |v| v >= start && v < end),
            RangeBounds::Ipv4 { start, end } => value.parse::<Ipv4Addr>().map_or(false, |v| {
                let v = u32::from(v);
                v >= u32::from(start) && v <= u32::from(end)
            }),
        }
    }
}

impl std::fmt::Display for PoolRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bounds {
            RangeBounds::Integer { start, end } => write!(f, "{} [{}, {})", self.kind, start, end),
            RangeBounds::Ipv4 { start, end } => write!(f, "{} [{}, {}]", self.kind, start, end),
        }
    }
}

fn parse_integer(raw: &str) -> Result<u32> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidRange(format!("'{}' is not a segment id", raw)))
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr> {
    raw.trim()
        .parse()
        .map_err(|_| Error::InvalidRange(format!("'{}' is not an IPv4 address", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_vlan_range_is_half_open() {
        let range = PoolRange::parse(PoolKind::PodVlan, "10", "20").unwrap();
        assert_eq!(range.len(), 10);
        let values = range.values();
        assert_eq!(values.first().map(String::as_str), Some("10"));
        assert_eq!(values.last().map(String::as_str), Some("19"));
        assert!(range.contains("19"));
        assert!(!range.contains("20"));
    }

    #[test]
    fn test_ip_range_is_inclusive() {
        let range = PoolRange::parse(PoolKind::PrivateIp, "10.0.0.10", "10.0.0.19").unwrap();
        assert_eq!(range.len(), 10);
        assert_eq!(range.values()[9], "10.0.0.19");

        let single = PoolRange::parse(PoolKind::PrivateIp, "10.0.0.1", "10.0.0.1").unwrap();
        assert_eq!(single.values(), vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_ip_range_crosses_octets() {
        let range = PoolRange::parse(PoolKind::PrivateIp, "10.0.0.254", "10.0.1.1").unwrap();
        assert_eq!(
            range.values(),
            vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]
        );
    }

    #[test]
    fn test_inverted_ranges_rejected() {
        assert_matches!(
            PoolRange::parse(PoolKind::PodVlan, "20", "20"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::VnetSegment, "30", "20"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::PrivateIp, "10.0.0.2", "10.0.0.1"),
            Err(Error::InvalidRange(_))
        );
    }

    #[test]
    fn test_domain_limits() {
        PoolRange::parse(PoolKind::PodVlan, "1", "4095").unwrap();
        assert_matches!(
            PoolRange::parse(PoolKind::PodVlan, "0", "10"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::PodVlan, "4000", "4096"),
            Err(Error::InvalidRange(_))
        );
        PoolRange::parse(PoolKind::VnetSegment, "5000", "16777216").unwrap();
        assert_matches!(
            PoolRange::parse(PoolKind::VnetSegment, "5000", "16777217"),
            Err(Error::InvalidRange(_))
        );
    }

    #[test]
    fn test_link_local_bounds() {
        PoolRange::parse(PoolKind::LinkLocalIp, "169.254.1.1", "169.254.1.50").unwrap();
        assert_matches!(
            PoolRange::parse(PoolKind::LinkLocalIp, "169.254.255.250", "169.255.0.1"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::LinkLocalIp, "10.0.0.1", "10.0.0.5"),
            Err(Error::InvalidRange(_))
        );
    }

    #[test]
    fn test_unparsable_bounds() {
        assert_matches!(
            PoolRange::parse(PoolKind::PodVlan, "ten", "20"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::PrivateIp, "10.0.0", "10.0.0.9"),
            Err(Error::InvalidRange(_))
        );
        assert_matches!(
            PoolRange::parse(PoolKind::PrivateIp, "10", "20"),
            Err(Error::InvalidRange(_))
        );
    }

    #[test]
    fn test_size_limit() {
        let range = PoolRange::parse(PoolKind::PrivateIp, "10.0.0.0", "10.255.255.255").unwrap();
        assert_eq!(range.len(), 1 << 24);
        assert_matches!(range.check_size(1 << 20), Err(Error::InvalidRange(_)));
        range.check_size(1 << 24).unwrap();
    }
}
