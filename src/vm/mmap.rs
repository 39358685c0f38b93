//! Memory-mapped files.
//!
//! A mapping binds a whole file into user address space, one writable
//! file-backed page descriptor per page, loaded lazily on first touch.
//! Unmapping evicts each page through the usual write-back path, so every
//! dirty byte is visible in the file once `unmap` returns; the file's
//! length never changes (the tail slack of the last page is never written
//! back).

use super::{
    fault::USER_TOP,
    frame::FrameTable,
    page::{FileMapping, PageKind, PageTable},
    swap::SwapTable,
};
use crate::{
    KernelError,
    fs::{FilesysInner, Inode},
    mm::{PAGE_SIZE, Va, pagedir::PageDirectory},
    sync::SpinLock,
};
use alloc::{collections::btree_map::BTreeMap, sync::Arc};
use log::debug;

/// Identifier of a mapping, unique per process and strictly increasing.
pub type MapId = usize;

/// One established mapping.
pub struct Mapping {
    base: Va,
    page_count: usize,
    inode: Arc<Inode>,
}

impl Mapping {
    /// First mapped user address.
    #[inline]
    pub fn base(&self) -> Va {
        self.base
    }

    /// Number of mapped pages.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }
}

struct TableState {
    maps: BTreeMap<MapId, Mapping>,
    next_id: MapId,
}

/// Per-process table of memory-mapped files.
pub struct MappingTable {
    inner: SpinLock<TableState>,
}

impl MappingTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(TableState {
                maps: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Maps `inode` at `base`, inserting one writable file-backed
    /// descriptor per page.
    ///
    /// Fails when the file is empty, the base is not page-aligned, the
    /// region leaves user space, or any required page already has a
    /// descriptor; a rejected mapping leaves no partial state behind.
    pub fn map(
        &self,
        pages: &PageTable,
        pagedir: &Arc<SpinLock<PageDirectory>>,
        fs: &FilesysInner,
        inode: &Arc<Inode>,
        base: Va,
    ) -> Result<MapId, KernelError> {
        if !base.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let length = inode.length();
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        if base.into_usize() + page_count * PAGE_SIZE > USER_TOP.into_usize() {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..page_count {
            if pages.contains(base + i * PAGE_SIZE) {
                return Err(KernelError::FileExist);
            }
        }

        fs.reopen(inode);
        let mut inserted = 0;
        let mut failed = None;
        for i in 0..page_count {
            let mapping = FileMapping {
                inode: inode.clone(),
                offset: i * PAGE_SIZE,
                valid_bytes: PAGE_SIZE.min(length - i * PAGE_SIZE),
                read_only: false,
            };
            match pages.insert(base + i * PAGE_SIZE, PageKind::File(mapping), true, pagedir) {
                Ok(page) => {
                    pages.check_in(&page);
                    inserted += 1;
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            for i in 0..inserted {
                pages.forget(base + i * PAGE_SIZE);
            }
            fs.close(inode);
            return Err(e);
        }

        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.maps.insert(
            id,
            Mapping {
                base,
                page_count,
                inode: inode.clone(),
            },
        );
        state.unlock();
        debug!("mmap: mapped {page_count} pages at {base:?} as id {id}");
        Ok(id)
    }

    /// Unmaps mapping `id`, writing dirty pages back to the file, and
    /// releases the file handle.
    pub fn unmap(
        &self,
        id: MapId,
        pages: &PageTable,
        frames: &FrameTable,
        swap: &SwapTable,
        fs: &FilesysInner,
    ) -> Result<(), KernelError> {
        let mut state = self.inner.lock();
        let mapping = state.maps.remove(&id);
        state.unlock();
        let Some(mapping) = mapping else {
            return Err(KernelError::NoSuchEntry);
        };

        let mut first_error = None;
        for i in 0..mapping.page_count {
            if let Err(e) = pages.remove(mapping.base + i * PAGE_SIZE, frames, swap) {
                first_error.get_or_insert(e);
            }
        }
        fs.close(&mapping.inode);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unmaps every mapping (process teardown).
    pub fn destroy(
        &self,
        pages: &PageTable,
        frames: &FrameTable,
        swap: &SwapTable,
        fs: &FilesysInner,
    ) {
        loop {
            let state = self.inner.lock();
            let id = state.maps.keys().next().copied();
            state.unlock();
            let Some(id) = id else { break };
            let _ = self.unmap(id, pages, frames, swap, fs);
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        let state = self.inner.lock();
        let n = state.maps.len();
        state.unlock();
        n
    }

    /// Whether no mappings exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}
