//! The once-per-batch wait/release primitive.
//!
//! The caller blocks in [`Completion::wait`]; the interrupt dispatcher calls
//! [`Completion::release`] when the last job finishes. A release guard makes extra releases
//! within one batch no-ops.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{Error, Result};

/// Batch completion signal shared by the caller and interrupt context.
pub struct Completion {
    signal: Signal<CriticalSectionRawMutex, ()>,
    released: AtomicBool,
    releases: AtomicU32,
}

impl Completion {
    /// Creates an unarmed completion.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
            released: AtomicBool::new(false),
            releases: AtomicU32::new(0),
        }
    }

    /// Prepares for a new batch, discarding any stale release from the previous one.
    pub fn arm(&self) {
        self.signal.reset();
        self.released.store(false, Ordering::SeqCst);
    }

    /// Releases the waiter. Returns `false` if this batch was already released.
    ///
    /// Safe to call from interrupt context.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.signal.signal(());
        true
    }

    /// Whether the current batch has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Total releases since creation (one per completed batch).
    #[must_use]
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Waits until released or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        with_timeout(timeout, self.signal.wait())
            .await
            .map_err(|_| Error::Timeout)
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
