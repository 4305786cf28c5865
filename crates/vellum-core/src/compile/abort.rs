//! Cooperative cancellation of compile requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for cancelling a compile request between retries.
///
/// Clones share one flag; aborting any clone is visible to all of them. An
/// in-flight engine invocation is never interrupted, the driver only checks
/// the flag before starting the next attempt.
///
/// # Example
///
/// ```
/// use vellum_core::compile::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let clone = handle.clone();
/// assert!(!handle.is_aborted());
///
/// clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a new handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request abort.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Clear the flag so the handle can be reused for another request.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}
