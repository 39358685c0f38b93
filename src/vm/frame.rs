//! Frame table.
//!
//! Tracks every physical user-pool frame, keyed by kernel virtual address.
//! [`FrameTable::acquire`] hands out free frames while the pool lasts; once
//! it is empty, a rotating clock hand sweeps the frame set, giving
//! recently-accessed pages a second chance and evicting the first page
//! whose owner can be locked without contention.
//!
//! Each frame carries a one-permit lock held across eviction and reload
//! I/O, so eviction of a frame can never race a concurrent user of the same
//! page: the user checks the descriptor out, and the evictor must take that
//! same check-out lock (with try-lock semantics) before touching the frame.

use super::{page::UserPage, swap::SwapTable};
use crate::{
    mm::{self, Kva, UserPool},
    sync::{Semaphore, SpinLock},
};
use alloc::{collections::btree_map::BTreeMap, sync::Arc};
use core::ops::Bound;
use crossbeam_utils::Backoff;
use log::debug;

/// One physical user-pool frame.
pub struct Frame {
    kva: Kva,
    /// One-permit frame lock; held across eviction and reload I/O.
    lock: Semaphore,
    /// The page currently living here. `None` marks a frame in transit
    /// (allocation or reload in progress).
    owner: SpinLock<Option<Arc<UserPage>>>,
    /// Owns the backing memory; returned to the pool when the record is
    /// dropped.
    _page: mm::Page,
}

impl Frame {
    /// Kernel virtual address of the frame's memory.
    #[inline]
    pub fn kva(&self) -> Kva {
        self.kva
    }

    /// The page currently occupying this frame.
    pub fn owner(&self) -> Option<Arc<UserPage>> {
        let guard = self.owner.lock();
        let owner = guard.clone();
        guard.unlock();
        owner
    }

    pub(crate) fn set_owner(&self, owner: Option<Arc<UserPage>>) {
        let mut guard = self.owner.lock();
        *guard = owner;
        guard.unlock();
    }

    /// Runs `f` with the frame lock held.
    pub(crate) fn lock_held<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.down();
        let result = f();
        self.lock.up();
        result
    }
}

struct FrameMap {
    map: BTreeMap<usize, Arc<Frame>>,
    /// Clock hand: kva of the most recently examined frame.
    hand: usize,
}

/// The kernel-wide table of user-pool frames.
pub struct FrameTable {
    pool: UserPool,
    frames: SpinLock<FrameMap>,
}

impl FrameTable {
    /// Builds the table over `pool`.
    pub fn new(pool: UserPool) -> Self {
        Self {
            pool,
            frames: SpinLock::new(FrameMap {
                map: BTreeMap::new(),
                hand: 0,
            }),
        }
    }

    /// Returns a frame locked for the caller, evicting another page if the
    /// pool is exhausted. `zeroed` guarantees zero-filled contents.
    ///
    /// May block on eviction I/O. The returned frame has no owner; the
    /// caller installs one (or discards the frame) before releasing it.
    pub fn acquire(&self, zeroed: bool, swap: &SwapTable) -> Arc<Frame> {
        let backoff = Backoff::new();
        loop {
            if let Some(page) = self.pool.alloc(zeroed) {
                let frame = Arc::new(Frame {
                    kva: page.kva(),
                    // Born locked by the caller.
                    lock: Semaphore::new(0),
                    owner: SpinLock::new(None),
                    _page: page,
                });
                let mut frames = self.frames.lock();
                frames.map.insert(frame.kva.into_usize(), frame.clone());
                frames.unlock();
                return frame;
            }

            let Some(frame) = self.advance_hand() else {
                backoff.snooze();
                continue;
            };
            if frame.lock.try_down().is_err() {
                // Mid-reload or mid-eviction elsewhere; move on.
                continue;
            }
            let Some(owner) = frame.owner() else {
                // Transient: allocation in progress.
                frame.lock.up();
                continue;
            };

            // Second chance: a recently accessed page is spared once.
            let mut pd = owner.pagedir().lock();
            if pd.is_accessed(owner.va()) {
                pd.set_accessed(owner.va(), false);
                pd.unlock();
                frame.lock.up();
                continue;
            }
            pd.unlock();

            match UserPage::try_evict(&owner, &frame, swap) {
                Ok(()) => {
                    if zeroed {
                        unsafe { mm::page_bytes(frame.kva) }.fill(0);
                    }
                    return frame;
                }
                Err(e) => {
                    debug!("frame {:?}: eviction failed ({e:?}), retrying", frame.kva);
                    frame.lock.up();
                    continue;
                }
            }
        }
    }

    /// Drops the caller's frame lock.
    pub fn release(&self, frame: &Arc<Frame>) {
        frame.lock.up();
    }

    /// The frame record at `kva`.
    pub fn get(&self, kva: Kva) -> Option<Arc<Frame>> {
        let frames = self.frames.lock();
        let frame = frames.map.get(&kva.into_usize()).cloned();
        frames.unlock();
        frame
    }

    /// Removes the frame record at `kva`; its memory returns to the pool
    /// once the last reference drops.
    pub fn free(&self, kva: Kva) {
        let mut frames = self.frames.lock();
        frames.map.remove(&kva.into_usize());
        frames.unlock();
    }

    /// Abandons a frame acquired but never linked to a page (reload error
    /// path). The caller still holds the frame lock.
    pub(crate) fn discard(&self, frame: &Arc<Frame>) {
        self.free(frame.kva);
    }

    /// Number of frames under the table's control.
    pub fn frame_count(&self) -> usize {
        let frames = self.frames.lock();
        let n = frames.map.len();
        frames.unlock();
        n
    }

    /// Advances the clock hand one step and returns the frame under it.
    fn advance_hand(&self) -> Option<Arc<Frame>> {
        let mut frames = self.frames.lock();
        let next = frames
            .map
            .range((Bound::Excluded(frames.hand), Bound::Unbounded))
            .next()
            .or_else(|| frames.map.iter().next())
            .map(|(kva, frame)| (*kva, frame.clone()));
        let result = next.map(|(kva, frame)| {
            frames.hand = kva;
            frame
        });
        frames.unlock();
        result
    }
}
