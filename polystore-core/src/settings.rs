//! Per-operation configuration
//!
//! Settings are a read-only value threaded explicitly through call
//! boundaries; the core never mutates them and keeps no process-wide
//! configuration state. Loading precedence (files, environment) belongs to
//! the caller; this module only defines the typed shape and a TOML parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;

/// Settings for one transfer direction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Concurrent whole-object operations
    pub object_threads: usize,
    /// Concurrent segment operations within one large object
    pub segment_threads: usize,
    /// Objects above this size are split into equal segments
    pub segment_size: u64,
    /// Skip a unit when size and content fingerprint match the destination
    pub skip_identical: bool,
    /// Local sources only: skip files not modified since `last_transfer`
    pub skip_unchanged: bool,
    /// Reference time for `skip_unchanged`, recorded by the caller
    pub last_transfer: Option<DateTime<Utc>>,
    /// Commit and validate a data manifest around the transfer
    pub use_manifest: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            object_threads: 10,
            segment_threads: 10,
            segment_size: 1024 * 1024 * 1024,
            skip_identical: false,
            skip_unchanged: false,
            last_transfer: None,
            use_manifest: false,
        }
    }
}

/// Retry schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the initial attempt
    pub num_retries: u32,
    pub initial_retry_sleep_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { num_retries: 5, initial_retry_sleep_ms: 1000 }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.num_retries + 1,
            initial_sleep: Duration::from_millis(self.initial_retry_sleep_ms),
            ..RetryPolicy::default()
        }
    }
}

/// Complete settings context consumed by the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub upload: TransferSettings,
    pub download: TransferSettings,
    pub retry: RetrySettings,
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> StoreResult<Self> {
        toml::from_str(raw).map_err(|e| StoreError::Configuration(e.to_string()))
    }
}

/// Parses a human size string ("512", "64K", "100M", "1G") into bytes.
pub fn parse_size(raw: &str) -> StoreResult<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::Configuration("empty size".into()));
    }
    let (digits, unit) = match raw.chars().last() {
        Some(c) if c.is_ascii_digit() => (raw, 1u64),
        Some('B') => (&raw[..raw.len() - 1], 1u64),
        Some('K') => (&raw[..raw.len() - 1], 1024),
        Some('M') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('G') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => return Err(StoreError::Configuration(format!("invalid size units: {raw}"))),
    };
    digits
        .parse::<u64>()
        .map(|n| n * unit)
        .map_err(|_| StoreError::Configuration(format!("invalid size: {raw}")))
}
