//! Progress events.
//!
//! The engine reports discrete events through [`ProgressSink`]; whether and
//! how they are rendered is the presentation layer's business
//! (see [`crate::progress`]).

use crate::engine::reconcile::WorkKind;
use crate::manifest::RunStats;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    EntryStarted {
        path: String,
        kind: WorkKind,
    },
    EntryCompleted {
        path: String,
        kind: WorkKind,
        bytes: u64,
    },
    EntryFailed {
        path: String,
        error: String,
    },
    RunFinished(RunStats),
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

/// Sink that drops everything; used headless and in tests.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &SyncEvent) {}
}
