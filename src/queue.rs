use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PeerError, Result};

/// Interactions admitted concurrently per queue.
pub const MAX_CONCURRENT_INTERACTIONS: usize = 4;

/// Minimum gap between successive admissions from the same queue. Keeps
/// bursts away from resource-constrained endpoints.
pub const INTERACTION_SPACING: Duration = Duration::from_millis(100);

/// Bounded-concurrency FIFO for outgoing interaction requests.
///
/// Admission order is strict arrival order (tokio's `Mutex` and `Semaphore`
/// queue fairly). Close is graceful: callers blocked in `admit` and new
/// callers fail, in-flight permits run to completion.
#[derive(Debug)]
pub struct InteractionQueue {
    // Serializes admissions; holds the instant of the last one.
    admission: Mutex<Option<Instant>>,
    slots: Arc<Semaphore>,
    closed: CancellationToken,
}

/// Slot held for the duration of one interaction; released on drop.
#[derive(Debug)]
pub struct InteractionPermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for InteractionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractionQueue {
    pub fn new() -> Self {
        Self {
            admission: Mutex::new(None),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_INTERACTIONS)),
            closed: CancellationToken::new(),
        }
    }

    /// Waits for an interaction slot. Resolves in arrival order, at least
    /// `INTERACTION_SPACING` after the previous admission.
    pub async fn admit(&self) -> Result<InteractionPermit> {
        let mut last = tokio::select! {
            _ = self.closed.cancelled() => return Err(Self::closed_error()),
            guard = self.admission.lock() => guard,
        };

        if let Some(previous) = *last {
            let due = previous + INTERACTION_SPACING;
            tokio::select! {
                _ = self.closed.cancelled() => return Err(Self::closed_error()),
                _ = tokio::time::sleep_until(due) => {}
            }
        }

        let permit = tokio::select! {
            _ = self.closed.cancelled() => return Err(Self::closed_error()),
            permit = self.slots.clone().acquire_owned() => permit
                .map_err(|_| PeerError::implementation("interaction queue semaphore closed"))?,
        };

        *last = Some(Instant::now());
        Ok(InteractionPermit { _permit: permit })
    }

    /// Stops admissions. In-flight interactions complete normally.
    pub fn close(&self) {
        debug!("closing interaction queue");
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_error() -> PeerError {
        PeerError::implementation("interaction queue is closed")
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
