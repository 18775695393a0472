//! Transfer orchestration for polystore
//!
//! Turns a recursive copy between two backends into a plan of independent
//! units, runs them through two bounded concurrency tiers (whole objects,
//! then segments within a large object), retries each unit, and optionally
//! brackets the whole run with a data manifest that is committed before the
//! data phase and validated after it.

pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod progress;

pub use manifest::{ManifestEntry, MANIFEST_NAME};
pub use orchestrator::{TransferOrchestrator, TransferReport};
pub use plan::{plan_segments, Segment, TransferUnit};
pub use progress::{NoopProgress, ProgressSink};
