//! Ingestion and reconciliation pipeline.

pub mod balance;
pub mod dedup;
pub mod normalize;
mod orchestrator;

pub use balance::{reconstruct, select_anchor, Anchor, Reconstruction};
pub use dedup::{filter_new, DedupOutcome};
pub use normalize::{
    normalize_feed, normalize_record, NormalizeError, NormalizedBatch, RawTransaction,
    RejectedRecord,
};
pub use orchestrator::{
    AccountReport, AccountStatus, CancellationFlag, ConnectionReport, FailureScope,
    RejectedRecordReport, SyncError, SyncFailure, SyncOptions, SyncOrchestrator, SyncResult,
};
