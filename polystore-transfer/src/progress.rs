//! Transfer progress reporting

/// Callback surface for transfer observers. Units report once, after their
/// retries settle.
pub trait ProgressSink: Send + Sync {
    fn on_unit_complete(&self, _address: &str, _bytes: u64) {}
    fn on_unit_skipped(&self, _address: &str) {}
}

/// Sink that drops every event
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}
