//! Synchronization primitives.
//!
//! Three primitives cover every locking need of the core:
//!
//! - [`SpinLock`] protects short critical sections (registry maps, entry
//!   metadata, bitmaps). Guards carry an explicit [`SpinLockGuard::unlock`].
//! - [`RwLock`] is writer-preferring: unbounded concurrent readers, and a
//!   waiting writer gates new readers so it cannot starve. The buffer cache
//!   uses it as the traversal / modification flow protocol over its entry
//!   set.
//! - [`Semaphore`] is a counting semaphore. With one permit it doubles as a
//!   check-out lock that can be held across blocking device I/O and across
//!   function boundaries (page descriptors, frames, cache-entry contents).

mod rwlock;
mod semaphore;
mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
