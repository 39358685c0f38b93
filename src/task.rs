//! Process record.
//!
//! A process, from the core's point of view, is a page directory plus two
//! per-process tables: the page table describing every user page, and the
//! table of memory-mapped files. The scheduler-side identity of the process
//! (thread, registers, exit protocol) belongs to the embedder; the core
//! only records the exit status it decides on.

use crate::{
    KernelError,
    fs::{FilesysInner, Inode},
    mm::{self, PAGE_SIZE, Va, pagedir::PageDirectory},
    sync::SpinLock,
    vm::{self, FrameTable, MapId, MappingTable, PageTable, SwapTable},
};
use alloc::sync::Arc;

/// Per-process memory state.
pub struct Process {
    pagedir: Arc<SpinLock<PageDirectory>>,
    /// Where every user page lives.
    pub pages: PageTable,
    /// Established memory-mapped files.
    pub mappings: MappingTable,
    exit_status: SpinLock<Option<i32>>,
}

impl Process {
    /// A fresh process with an empty address space.
    pub fn new() -> Self {
        Self {
            pagedir: Arc::new(SpinLock::new(PageDirectory::new())),
            pages: PageTable::new(),
            mappings: MappingTable::new(),
            exit_status: SpinLock::new(None),
        }
    }

    /// The process's page directory.
    pub fn pagedir(&self) -> &Arc<SpinLock<PageDirectory>> {
        &self.pagedir
    }

    /// Records an exit status (first writer wins).
    pub fn mark_exited(&self, status: i32) {
        let mut guard = self.exit_status.lock();
        guard.get_or_insert(status);
        guard.unlock();
    }

    /// The recorded exit status, if the process has been terminated.
    pub fn exit_status(&self) -> Option<i32> {
        let guard = self.exit_status.lock();
        let status = *guard;
        guard.unlock();
        status
    }

    /// Marks the process killed for a bad memory access and returns the
    /// error the faulting path reports.
    pub(crate) fn kill(&self) -> KernelError {
        self.mark_exited(-1);
        KernelError::BadAddress
    }

    /// Resolves a page fault at `fault_addr` with user stack pointer `sp`.
    pub fn page_fault(
        &self,
        frames: &FrameTable,
        swap: &SwapTable,
        fault_addr: Va,
        sp: Va,
        write: bool,
    ) -> Result<(), KernelError> {
        vm::handle_page_fault(self, frames, swap, fault_addr, sp, write)
    }

    /// Maps `inode` into the address space at `base`.
    pub fn mmap(
        &self,
        fs: &FilesysInner,
        inode: &Arc<Inode>,
        base: Va,
    ) -> Result<MapId, KernelError> {
        self.mappings.map(&self.pages, &self.pagedir, fs, inode, base)
    }

    /// Removes mapping `id`, writing dirty pages back to the file.
    pub fn munmap(
        &self,
        id: MapId,
        frames: &FrameTable,
        swap: &SwapTable,
        fs: &FilesysInner,
    ) -> Result<(), KernelError> {
        self.mappings.unmap(id, &self.pages, frames, swap, fs)
    }

    /// Whether the whole byte range is backed by descriptors this process
    /// may access (`write` additionally requires writability). This is the
    /// validation the system-call layer runs on user-supplied buffers; it
    /// does not trigger demand paging.
    pub fn access_ok(&self, start: Va, len: usize, write: bool) -> bool {
        if len == 0 {
            return true;
        }
        let end = start.into_usize() + len;
        if end > vm::USER_TOP.into_usize() {
            return false;
        }
        let mut page = start.page_down().into_usize();
        while page < end {
            let va = Va(page);
            let ok = if write {
                self.pages.is_writable(va)
            } else {
                self.pages.contains(va)
            };
            if !ok {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// Copies `buf.len()` bytes of user memory at `va` into `buf`,
    /// faulting pages in as needed.
    ///
    /// An unmapped or kernel-range address terminates the process with exit
    /// code -1, exactly as a hardware fault there would.
    pub fn read_user(
        &self,
        frames: &FrameTable,
        swap: &SwapTable,
        va: Va,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        self.copy_user(frames, swap, va, buf.len(), false, |kva, off, chunk, done| {
            let frame = unsafe { mm::page_bytes(kva) };
            buf[done..done + chunk].copy_from_slice(&frame[off..off + chunk]);
        })
    }

    /// Copies `data` into user memory at `va`, faulting pages in as needed
    /// and marking them dirty.
    pub fn write_user(
        &self,
        frames: &FrameTable,
        swap: &SwapTable,
        va: Va,
        data: &[u8],
    ) -> Result<(), KernelError> {
        self.copy_user(frames, swap, va, data.len(), true, |kva, off, chunk, done| {
            let frame = unsafe { mm::page_bytes(kva) };
            frame[off..off + chunk].copy_from_slice(&data[done..done + chunk]);
        })
    }

    fn copy_user(
        &self,
        frames: &FrameTable,
        swap: &SwapTable,
        va: Va,
        len: usize,
        write: bool,
        mut copy: impl FnMut(mm::Kva, usize, usize, usize),
    ) -> Result<(), KernelError> {
        let mut done = 0;
        while done < len {
            let addr = va + done;
            if addr >= vm::USER_TOP {
                return Err(self.kill());
            }
            let base = addr.page_down();
            let Some(page) = self.pages.check_out(base) else {
                return Err(self.kill());
            };
            if write && !page.writable() {
                self.pages.check_in(&page);
                return Err(self.kill());
            }
            if let Err(e) = vm::UserPage::reload(&page, frames, swap) {
                self.pages.check_in(&page);
                return Err(e);
            }
            let kva = page
                .frame_kva()
                .unwrap_or_else(|| panic!("page {base:?}: not resident after reload"));
            let off = addr.page_offset();
            let chunk = (len - done).min(PAGE_SIZE - off);
            copy(kva, off, chunk, done);

            let mut pd = self.pagedir.lock();
            pd.set_accessed(base, true);
            if write {
                pd.set_dirty(base, true);
            }
            pd.unlock();
            self.pages.check_in(&page);
            done += chunk;
        }
        Ok(())
    }

    /// Tears the whole address space down: unmaps every mapping (writing
    /// dirty pages to their files), then drains the page table, releasing
    /// frames and swap slots.
    pub fn destroy(&self, frames: &FrameTable, swap: &SwapTable, fs: &FilesysInner) {
        self.mappings.destroy(&self.pages, frames, swap, fs);
        self.pages.destroy(frames, swap);
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}
