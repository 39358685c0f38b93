//! Writer-preferring reader-writer lock.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};
use crossbeam_utils::Backoff;

const WRITER: usize = 1 << (usize::BITS - 1);

/// A reader-writer lock with writer preference.
///
/// This type of lock allows a number of readers or at most one writer at any
/// point in time. While a writer is waiting, new readers block, so a stream
/// of readers cannot starve a writer; once the writer releases, the blocked
/// readers proceed.
///
/// The buffer cache relies on exactly these semantics for its entry set:
/// lookups and sweeps traverse under [`read`], structural mutation (insert,
/// victim re-key) happens under [`write`], and a pending mutation drains the
/// traversers without being starved by new ones.
///
/// [`read`]: Self::read
/// [`write`]: Self::write
pub struct RwLock<T>
where
    T: ?Sized + Send,
{
    // Reader count, with the top bit flagging a writer holding the lock.
    state: AtomicUsize,
    // Writers that are waiting to acquire; readers defer to them.
    writers_waiting: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for RwLock<T> where T: ?Sized + Send {}
unsafe impl<T> Send for RwLock<T> where T: ?Sized + Send {}

impl<T> RwLock<T>
where
    T: Send,
{
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub const fn new(data: T) -> RwLock<T> {
        RwLock {
            state: AtomicUsize::new(0),
            writers_waiting: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this `RwLock`, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Locks this rwlock with shared read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// The calling thread will be blocked until there is no writer which
    /// holds the lock and no writer waiting for it. There may be other
    /// readers inside the lock when this method returns.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self.writers_waiting.load(Ordering::Acquire) == 0 {
                let prev = self.state.load(Ordering::Relaxed);
                if prev & WRITER == 0
                    && self
                        .state
                        .compare_exchange_weak(prev, prev + 1, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
            }
            backoff.snooze();
        }
    }

    /// Locks this rwlock with exclusive write access, blocking the current
    /// thread until it can be acquired.
    ///
    /// While this call is blocked, new readers are held back as well, so the
    /// writer only has to wait for the readers already inside.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.writers_waiting.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self
                .state
                .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writers_waiting.fetch_sub(1, Ordering::Release);
                return RwLockWriteGuard { lock: self };
            }
            backoff.snooze();
        }
    }
}

/// RAII structure used to release the shared read access of a lock when
/// dropped.
pub struct RwLockReadGuard<'a, T>
where
    T: ?Sized + Send + 'a,
{
    lock: &'a RwLock<T>,
}

/// RAII structure used to release the exclusive write access of a lock when
/// dropped.
pub struct RwLockWriteGuard<'a, T>
where
    T: ?Sized + Send + 'a,
{
    lock: &'a RwLock<T>,
}

impl<T: ?Sized + Send> RwLockReadGuard<'_, T> {
    /// Releases the shared access.
    #[inline]
    pub fn unlock(self) {}
}

impl<T: ?Sized + Send> RwLockWriteGuard<'_, T> {
    /// Releases the exclusive access.
    #[inline]
    pub fn unlock(self) {}
}

impl<T: ?Sized + Send> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T: ?Sized + Send> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}
