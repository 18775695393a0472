//! Error types for polystore

use thiserror::Error;

/// Result type alias
pub type StoreResult<T> = Result<T, StoreError>;

/// One failed unit inside an aggregate transfer error.
#[derive(Debug)]
pub struct UnitFailure {
    /// Normalized source address of the unit that failed
    pub address: String,
    /// The error that terminated the unit after retries
    pub error: Box<StoreError>,
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.error)
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("No backend registered for: {0}")]
    UnregisteredBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Multiple objects share the name: {0}")]
    DuplicateName(String),

    #[error("Folder paths have no canonical form: {0}")]
    NoCanonicalForm(String),

    #[error("Condition not met: {0}")]
    ConditionNotMet(String),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Target already exists: {0}")]
    TargetExists(String),

    #[error("Transfer inconsistent with manifest, offending paths: {}", paths.join(", "))]
    InconsistentTransfer { paths: Vec<String> },

    #[error("{} of {} transfer units failed", failures.len(), failures.len() + succeeded.len())]
    PartialTransfer {
        failures: Vec<UnitFailure>,
        succeeded: Vec<String>,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether the retry harness may retry after this error.
    ///
    /// Transient errors mirror the backend conditions worth waiting out:
    /// unavailability, throttling, and network flakiness. Everything else
    /// propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::Network(_)
                | StoreError::RateLimited { .. }
                | StoreError::Timeout(_)
        )
    }

    /// Whether this error poisons an entire transfer rather than a single
    /// unit. Authorization failures apply to every sibling unit, so the
    /// orchestrator aborts outstanding work when it sees one.
    pub fn is_transfer_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unauthorized(_) | StoreError::Configuration(_)
        )
    }
}
