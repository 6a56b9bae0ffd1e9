//! Bounded concurrency per provider scope.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// No slot became free within the wait budget.
///
/// The caller must not proceed to the network call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("timed out waiting for a {scope} slot after {waited_ms}ms")]
pub struct AcquireTimeoutError {
    pub scope: String,
    pub waited_ms: u64,
}

/// Counting semaphore bounding in-flight calls to one provider scope.
///
/// Waiters are served in arrival order (the underlying tokio semaphore is
/// fair), so a burst of callers drains FIFO as slots free up. Each vendor
/// scope gets its own instance; a saturated vendor cannot starve others.
#[derive(Debug, Clone)]
pub struct ProviderSemaphore {
    inner: Arc<Semaphore>,
    scope: String,
    max: usize,
}

impl ProviderSemaphore {
    pub fn new(max: usize, scope: impl Into<String>) -> Self {
        let max = max.max(1);
        Self {
            inner: Arc::new(Semaphore::new(max)),
            scope: scope.into(),
            max,
        }
    }

    /// Wait for a slot, up to `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<SlotGuard, AcquireTimeoutError> {
        match tokio::time::timeout(timeout, self.inner.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(SlotGuard {
                permit: Some(permit),
                scope: self.scope.clone(),
            }),
            // The semaphore is never closed; treat a closed error like a
            // timeout so callers back off instead of panicking.
            Ok(Err(_)) | Err(_) => {
                debug!(scope = %self.scope, "semaphore acquire timed out");
                Err(AcquireTimeoutError {
                    scope: self.scope.clone(),
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn max_concurrency(&self) -> usize {
        self.max
    }

    /// Slots currently free (diagnostics only; racy by nature).
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

/// Held slot. Freed on `release()` or on drop, exactly once.
#[derive(Debug)]
pub struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    scope: String,
}

impl SlotGuard {
    /// Free the slot. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            debug!(scope = %self.scope, "slot released");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}
