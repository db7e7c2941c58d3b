//! Injectable wait source for ramps, settling and polling.
//!
//! Production code waits on the tokio timer. Tests use [`RecordingClock`], which returns at once
//! and writes each requested wait into the shared [`Journal`], so a whole run executes in
//! microseconds with its timing still checkable.

use async_trait::async_trait;
use std::time::Duration;

use crate::hardware::mock::{Journal, JournalEntry};

/// Something that can block the sequence for a while.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real time, via `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records waits instead of performing them.
#[derive(Debug, Clone)]
pub struct RecordingClock {
    journal: Journal,
}

impl RecordingClock {
    /// Record into `journal`, alongside whatever mocks share it.
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.journal.record(JournalEntry::Sleep(duration));
    }
}
