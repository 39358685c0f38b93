//! Counting semaphore.

use super::WouldBlock;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::Backoff;

/// A counting semaphore.
///
/// A semaphore maintains a count of available permits. [`down`] consumes a
/// permit, blocking while none is available; [`up`] returns one.
///
/// With a single permit a semaphore serves as an exclusion lock that, unlike
/// a guard-based lock, may be held across blocking device I/O and across
/// function boundaries. The check-out/check-in discipline on page
/// descriptors, the per-frame lock, and the content lock of a buffer-cache
/// entry are all built this way.
///
/// [`down`]: Self::down
/// [`up`]: Self::up
pub struct Semaphore {
    count: AtomicUsize,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            count: AtomicUsize::new(permits),
        }
    }

    /// Acquires a permit, blocking until one is available.
    pub fn down(&self) {
        let backoff = Backoff::new();
        loop {
            let cur = self.count.load(Ordering::Relaxed);
            if cur > 0
                && self
                    .count
                    .compare_exchange_weak(cur, cur - 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Acquires a permit if one is immediately available.
    ///
    /// This function does not block.
    pub fn try_down(&self) -> Result<(), WouldBlock> {
        let mut cur = self.count.load(Ordering::Relaxed);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => cur = seen,
            }
        }
        Err(WouldBlock)
    }

    /// Releases a permit, waking one blocked [`down`].
    ///
    /// [`down`]: Self::down
    pub fn up(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }
}
