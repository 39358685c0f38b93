//! Per-process page table and page descriptors.
//!
//! A [`UserPage`] records where one user page currently lives: backed by a
//! file range, zero-filled, or out on swap, plus the frame holding it while
//! resident. The per-process [`PageTable`] maps user page bases to
//! descriptors.
//!
//! ## Check-out discipline
//!
//! Every descriptor carries a one-permit check-out lock. The page-fault and
//! user-copy paths check a descriptor out before reloading or touching its
//! frame, and the evictor acquires the same lock with try-lock semantics,
//! abandoning the victim on contention. A checked-out page can therefore
//! never be evicted underneath its user, and a reload is atomic with
//! respect to eviction of the same page.
//!
//! ## Kind transitions
//!
//! Writable file-backed pages are written back to their file range when
//! evicted dirty; they stay file-backed and are never moved to swap.
//! Zero-filled pages promote to `Swapped` on their first dirty eviction and
//! stay `Swapped` from then on; a later eviction writes a fresh slot.

use super::{
    frame::{Frame, FrameTable},
    swap::{SwapSlot, SwapTable},
};
use crate::{
    KernelError,
    fs::Inode,
    mm::{self, Kva, Va, pagedir::PageDirectory},
    sync::{Semaphore, SpinLock},
};
use alloc::{
    collections::btree_map::{BTreeMap, Entry},
    sync::Arc,
    vec::Vec,
};

/// File range backing one page.
#[derive(Clone)]
pub struct FileMapping {
    /// Backing file.
    pub inode: Arc<Inode>,
    /// Byte offset of this page within the file.
    pub offset: usize,
    /// Bytes of the page that exist in the file; the rest is zero-filled
    /// on load and never written back.
    pub valid_bytes: usize,
    /// Never written back (executable image pages).
    pub read_only: bool,
}

/// Where a non-resident page's contents live.
#[derive(Clone)]
pub enum PageKind {
    /// Loaded from (and, when writable and dirty, written back to) a file
    /// range.
    File(FileMapping),
    /// Anonymous memory: zero-filled on first touch.
    Zero,
    /// Lives on swap. `slot` is `None` while the page is resident, since
    /// swap-in frees the slot.
    Swapped { slot: Option<SwapSlot> },
}

struct PageState {
    kind: PageKind,
    /// Frame currently holding this page; the frame table's record for
    /// this address is the authoritative owner link.
    frame: Option<Kva>,
}

/// Descriptor for one user page.
pub struct UserPage {
    va: Va,
    writable: bool,
    pagedir: Arc<SpinLock<PageDirectory>>,
    /// Check-out lock; held across reload and eviction I/O.
    lock: Semaphore,
    state: SpinLock<PageState>,
}

impl UserPage {
    /// User page base this descriptor covers.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user writes are allowed.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The page directory this page is installed into.
    pub(crate) fn pagedir(&self) -> &Arc<SpinLock<PageDirectory>> {
        &self.pagedir
    }

    /// Frame currently holding this page, if resident.
    pub fn frame_kva(&self) -> Option<Kva> {
        let state = self.state.lock();
        let kva = state.frame;
        state.unlock();
        kva
    }

    fn kind_snapshot(&self) -> PageKind {
        let state = self.state.lock();
        let kind = state.kind.clone();
        state.unlock();
        kind
    }

    /// Brings the page into a frame and installs the hardware mapping.
    ///
    /// The caller must have the page checked out. A page that is already
    /// resident is left alone. May evict another page and may block on
    /// device I/O.
    pub fn reload(
        this: &Arc<UserPage>,
        frames: &FrameTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        {
            let state = this.state.lock();
            let resident = state.frame.is_some();
            state.unlock();
            if resident {
                return Ok(());
            }
        }

        let kind = this.kind_snapshot();
        let frame = frames.acquire(matches!(kind, PageKind::Zero), swap);
        match &kind {
            PageKind::Zero => {}
            PageKind::File(fm) => {
                let data = unsafe { mm::page_bytes(frame.kva()) };
                let read = match fm.inode.read_at(&mut data[..fm.valid_bytes], fm.offset) {
                    Ok(n) => n,
                    Err(e) => {
                        frames.discard(&frame);
                        return Err(e);
                    }
                };
                data[read..].fill(0);
            }
            PageKind::Swapped { slot: Some(slot) } => {
                swap.read(*slot, frame.kva());
                let mut state = this.state.lock();
                state.kind = PageKind::Swapped { slot: None };
                state.unlock();
            }
            PageKind::Swapped { slot: None } => {
                panic!("page {:?}: swapped out without a slot", this.va)
            }
        }

        let mut pd = this.pagedir.lock();
        pd.set_page(this.va, frame.kva(), this.writable);
        pd.unlock();

        frame.set_owner(Some(this.clone()));
        let mut state = this.state.lock();
        state.frame = Some(frame.kva());
        state.unlock();
        frames.release(&frame);
        Ok(())
    }

    /// Writes the frame's contents to their backing store as appropriate
    /// for `kind` and the dirty bit, returning the page's post-eviction
    /// kind.
    fn flush_frame(
        &self,
        kind: PageKind,
        dirty: bool,
        kva: Kva,
        swap: &SwapTable,
    ) -> Result<PageKind, KernelError> {
        match kind {
            PageKind::Swapped { .. } => Ok(PageKind::Swapped {
                slot: Some(swap.write(kva)),
            }),
            PageKind::Zero => {
                if dirty {
                    Ok(PageKind::Swapped {
                        slot: Some(swap.write(kva)),
                    })
                } else {
                    Ok(PageKind::Zero)
                }
            }
            PageKind::File(fm) => {
                if !fm.read_only && dirty {
                    let data = unsafe { mm::page_bytes(kva) };
                    let written = fm.inode.write_at(&data[..fm.valid_bytes], fm.offset)?;
                    if written < fm.valid_bytes {
                        // The backing file currently denies writes.
                        return Err(KernelError::OperationNotPermitted);
                    }
                }
                Ok(PageKind::File(fm))
            }
        }
    }

    /// Eviction path, called by the frame-table sweep with the frame lock
    /// held.
    ///
    /// Takes the check-out lock with try-lock semantics; `Busy` tells the
    /// sweep to pick another victim. On success the hardware mapping is
    /// gone, the contents are safe in their backing store, and the frame is
    /// detached.
    pub(crate) fn try_evict(
        this: &Arc<UserPage>,
        frame: &Arc<Frame>,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        if this.lock.try_down().is_err() {
            return Err(KernelError::Busy);
        }
        let state = this.state.lock();
        let owns = state.frame == Some(frame.kva());
        state.unlock();
        if !owns {
            this.lock.up();
            return Err(KernelError::Busy);
        }

        // Unmap first so further user accesses fault and cannot race the
        // write-back.
        let mut pd = this.pagedir.lock();
        let dirty = pd.is_dirty(this.va);
        pd.clear_page(this.va);
        pd.unlock();

        match this.flush_frame(this.kind_snapshot(), dirty, frame.kva(), swap) {
            Ok(kind) => {
                let mut state = this.state.lock();
                state.kind = kind;
                state.frame = None;
                state.unlock();
                frame.set_owner(None);
                this.lock.up();
                Ok(())
            }
            Err(e) => {
                // Re-install the mapping; the page stays resident and the
                // sweep moves on to another victim.
                let mut pd = this.pagedir.lock();
                pd.set_page(this.va, frame.kva(), this.writable);
                pd.set_dirty(this.va, dirty);
                pd.unlock();
                this.lock.up();
                Err(e)
            }
        }
    }
}

/// Per-process map from user page base to page descriptor.
pub struct PageTable {
    pages: SpinLock<BTreeMap<usize, Arc<UserPage>>>,
}

impl PageTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            pages: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Creates a descriptor for page `va` and returns it checked out.
    ///
    /// Fails with `FileExist` when the page already has a descriptor.
    pub fn insert(
        &self,
        va: Va,
        kind: PageKind,
        writable: bool,
        pagedir: &Arc<SpinLock<PageDirectory>>,
    ) -> Result<Arc<UserPage>, KernelError> {
        debug_assert!(va.is_page_aligned());
        let page = Arc::new(UserPage {
            va,
            writable,
            pagedir: pagedir.clone(),
            // Born checked out by the caller.
            lock: Semaphore::new(0),
            state: SpinLock::new(PageState { kind, frame: None }),
        });
        let mut pages = self.pages.lock();
        let result = match pages.entry(va.into_usize()) {
            Entry::Occupied(_) => Err(KernelError::FileExist),
            Entry::Vacant(slot) => {
                slot.insert(page.clone());
                Ok(page)
            }
        };
        pages.unlock();
        result
    }

    /// Checks the descriptor for page `va` out, pinning it against
    /// eviction until [`PageTable::check_in`].
    pub fn check_out(&self, va: Va) -> Option<Arc<UserPage>> {
        debug_assert!(va.is_page_aligned());
        loop {
            let pages = self.pages.lock();
            let page = pages.get(&va.into_usize()).cloned();
            pages.unlock();
            let page = page?;

            page.lock.down();
            // The descriptor may have been torn down while we waited.
            let pages = self.pages.lock();
            let still = pages
                .get(&va.into_usize())
                .is_some_and(|p| Arc::ptr_eq(p, &page));
            pages.unlock();
            if still {
                return Some(page);
            }
            page.lock.up();
        }
    }

    /// Releases a checked-out descriptor.
    pub fn check_in(&self, page: &Arc<UserPage>) {
        page.lock.up();
    }

    /// Whether page `va` has a descriptor.
    pub fn contains(&self, va: Va) -> bool {
        let pages = self.pages.lock();
        let yes = pages.contains_key(&va.page_down().into_usize());
        pages.unlock();
        yes
    }

    /// Whether page `va` exists and allows user writes.
    pub fn is_writable(&self, va: Va) -> bool {
        let pages = self.pages.lock();
        let yes = pages
            .get(&va.page_down().into_usize())
            .is_some_and(|p| p.writable);
        pages.unlock();
        yes
    }

    /// Number of descriptors in the table.
    pub fn len(&self) -> usize {
        let pages = self.pages.lock();
        let n = pages.len();
        pages.unlock();
        n
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a descriptor that was never made resident (mapping-setup
    /// rollback).
    pub(crate) fn forget(&self, va: Va) {
        if let Some(page) = self.check_out(va) {
            debug_assert!(page.frame_kva().is_none());
            let mut pages = self.pages.lock();
            pages.remove(&va.into_usize());
            pages.unlock();
            page.lock.up();
        }
    }

    /// Forces page `va` out of memory through the usual write-back path,
    /// leaving the descriptor in place.
    ///
    /// The caller must not have the page checked out; a checked-out page
    /// reports `Busy`. A page that is not resident is already done.
    pub fn evict(
        &self,
        va: Va,
        frames: &FrameTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        let pages = self.pages.lock();
        let page = pages.get(&va.page_down().into_usize()).cloned();
        pages.unlock();
        let Some(page) = page else {
            return Err(KernelError::NoSuchEntry);
        };
        let Some(kva) = page.frame_kva() else {
            return Ok(());
        };
        let Some(frame) = frames.get(kva) else {
            return Ok(());
        };
        frame.lock_held(|| {
            // Re-check under the frame lock; the page may have moved on.
            match frame.owner() {
                Some(owner) if Arc::ptr_eq(&owner, &page) => {
                    UserPage::try_evict(&owner, &frame, swap)?;
                    // Unlike the sweep, nobody is waiting to reuse this
                    // frame; return it to the pool.
                    frames.free(kva);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    /// Evicts (writing dirty file pages back) and removes the descriptor
    /// for page `va`: the unmap path.
    pub fn remove(
        &self,
        va: Va,
        frames: &FrameTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        let Some(page) = self.check_out(va) else {
            return Err(KernelError::NoSuchEntry);
        };

        let result = (|| {
            let Some(kva) = page.frame_kva() else {
                // Not resident: only a swap slot can be holding state.
                if let PageKind::Swapped { slot: Some(slot) } = page.kind_snapshot() {
                    swap.free(slot);
                }
                return Ok(());
            };
            let frame = frames
                .get(kva)
                .unwrap_or_else(|| panic!("page {va:?}: resident without a frame record"));
            frame.lock_held(|| {
                let mut pd = page.pagedir.lock();
                let dirty = pd.is_dirty(va);
                pd.clear_page(va);
                pd.unlock();

                match page.flush_frame(page.kind_snapshot(), dirty, kva, swap) {
                    Ok(kind) => {
                        // The page is leaving the address space; a swap
                        // copy written on its behalf is not needed.
                        if let PageKind::Swapped { slot: Some(slot) } = kind {
                            swap.free(slot);
                        }
                        let mut state = page.state.lock();
                        state.frame = None;
                        state.unlock();
                        frame.set_owner(None);
                        frames.free(kva);
                        Ok(())
                    }
                    Err(e) => {
                        let mut pd = page.pagedir.lock();
                        pd.set_page(va, kva, page.writable);
                        pd.set_dirty(va, dirty);
                        pd.unlock();
                        Err(e)
                    }
                }
            })
        })();

        if result.is_ok() {
            let mut pages = self.pages.lock();
            pages.remove(&va.into_usize());
            pages.unlock();
        }
        page.lock.up();
        result
    }

    /// Tears the whole table down: swap slots are released, resident
    /// frames are freed, nothing is written back.
    pub fn destroy(&self, frames: &FrameTable, swap: &SwapTable) {
        let mut pages = self.pages.lock();
        let all: Vec<Arc<UserPage>> = pages.values().cloned().collect();
        pages.clear();
        pages.unlock();

        for page in all {
            page.lock.down();
            let mut state = page.state.lock();
            let frame_kva = state.frame.take();
            let kind = state.kind.clone();
            state.unlock();

            if let Some(kva) = frame_kva {
                if let Some(frame) = frames.get(kva) {
                    frame.lock_held(|| {
                        let mut pd = page.pagedir.lock();
                        pd.clear_page(page.va);
                        pd.unlock();
                        frame.set_owner(None);
                        frames.free(kva);
                    });
                }
            } else if let PageKind::Swapped { slot: Some(slot) } = kind {
                swap.free(slot);
            }
            page.lock.up();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
