//! Configuration
//!
//! Allocator, provisioning and MAC generator settings. Loaded from YAML or
//! JSON (chosen by file extension); every field has a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Allocator Configuration
// =============================================================================

/// Configuration for the take/release path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Random candidates tried before a take gives up with `Contention`
    pub max_take_attempts: u32,
    /// Bound on waiting for a single row lock, in milliseconds
    pub lock_wait_ms: u64,
    /// Bound on caller-side backoff retries of transient errors, in milliseconds
    pub retry_max_elapsed_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_take_attempts: 8,
            lock_wait_ms: 2_000,
            retry_max_elapsed_ms: 10_000,
        }
    }
}

impl AllocatorConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.retry_max_elapsed_ms)
    }
}

// =============================================================================
// Provisioning Configuration
// =============================================================================

/// Configuration for range provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Largest number of entries a single range may insert
    pub max_range_entries: u64,
    /// Bound on waiting for leased rows to unlock during a delete, in milliseconds
    pub lock_wait_ms: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_range_entries: 1 << 20,
            lock_wait_ms: 2_000,
        }
    }
}

impl ProvisionerConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

// =============================================================================
// MAC Generator Configuration
// =============================================================================

/// Configuration for MAC pair generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacGeneratorConfig {
    /// Administrative prefix placed in bits 40-47
    pub prefix: u8,
    /// Largest sequence value that may be packed into an address
    pub max_sequence: u64,
}

impl Default for MacGeneratorConfig {
    fn default() -> Self {
        Self {
            prefix: crate::mac::DEFAULT_MAC_PREFIX,
            max_sequence: crate::mac::MAX_MAC_SEQUENCE,
        }
    }
}

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Complete netpool configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetpoolConfig {
    pub allocator: AllocatorConfig,
    pub provisioning: ProvisionerConfig,
    pub mac: MacGeneratorConfig,
}

impl NetpoolConfig {
    /// Load configuration from a YAML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: NetpoolConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the allocator cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.allocator.max_take_attempts == 0 {
            return Err(Error::Configuration(
                "allocator.max_take_attempts must be at least 1".into(),
            ));
        }
        if self.allocator.lock_wait_ms == 0 {
            return Err(Error::Configuration(
                "allocator.lock_wait_ms must be greater than zero".into(),
            ));
        }
        if self.provisioning.max_range_entries == 0 {
            return Err(Error::Configuration(
                "provisioning.max_range_entries must be at least 1".into(),
            ));
        }
        if self.provisioning.lock_wait_ms == 0 {
            return Err(Error::Configuration(
                "provisioning.lock_wait_ms must be greater than zero".into(),
            ));
        }
        if self.mac.max_sequence == 0 || self.mac.max_sequence > crate::mac::MAX_MAC_SEQUENCE {
            return Err(Error::Configuration(format!(
                "mac.max_sequence must be in 1..={}",
                crate::mac::MAX_MAC_SEQUENCE
            )));
        }
        Ok(())
    }
}
