use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable flag for asking a running [`TaskRunner`](crate::TaskRunner) to stop
/// dispatching.
///
/// Items already handed to a worker run to completion; items still queued
/// come back as [`TaskOutcome::NotAttempted`](crate::TaskOutcome::NotAttempted).
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
