//! Error types for netpool
//!
//! Provides structured error types for the pool store, allocator, range
//! provisioner, MAC generator and the configuration/persistence layers.

use crate::domain::ports::{EntryId, PoolScope};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the allocator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Pool exhausted: no free entry in {scope}")]
    PoolExhausted { scope: PoolScope },

    #[error("Contention in {scope}: no row could be locked after {attempts} attempts")]
    Contention { scope: PoolScope, attempts: u32 },

    #[error("Lock wait timeout on entry {entry_id} in {scope}")]
    LockTimeout { scope: PoolScope, entry_id: EntryId },

    #[error("Entry {entry_id} no longer exists in {scope}")]
    EntryNotFound { scope: PoolScope, entry_id: EntryId },

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Duplicate value {value} in {scope}")]
    DuplicateValue { scope: PoolScope, value: String },

    #[error("Scope {scope} still has {taken} allocated entries")]
    ScopeInUse { scope: PoolScope, taken: usize },

    // =========================================================================
    // Sequence Errors
    // =========================================================================
    #[error("Sequence {name} exhausted at {value}")]
    SequenceExhausted { name: String, value: u64 },

    // =========================================================================
    // MAC Errors
    // =========================================================================
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Invalid MAC mask {mask:#x}: must fit in 48 bits and leave the pair marker clear")]
    InvalidMacMask { mask: u64 },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, operator or workflow intervention needed
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Contention { .. } | Error::LockTimeout { .. } | Error::EntryNotFound { .. } => {
                ErrorAction::RetryWithBackoff
            }

            // Filesystem hiccups on the snapshot
            Error::Io(_) => ErrorAction::RetryAfter(Duration::from_secs(1)),

            // Capacity, input and state errors need intervention
            Error::PoolExhausted { .. }
            | Error::InvalidRange(_)
            | Error::DuplicateValue { .. }
            | Error::ScopeInUse { .. }
            | Error::SequenceExhausted { .. }
            | Error::InvalidMacAddress(_)
            | Error::InvalidMacMask { .. }
            | Error::Configuration(_) => ErrorAction::NoRetry,

            // Corrupt state and bugs
            Error::Internal(_)
            | Error::Snapshot(_)
            | Error::Metrics(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Contention { .. } | Error::LockTimeout { .. } | Error::EntryNotFound { .. }
        )
    }
}

/// Result type alias for netpool
pub type Result<T> = std::result::Result<T, Error>;
