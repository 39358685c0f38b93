//! Per-process page directory.
//!
//! The hardware structure the MMU walks, modeled in software: a map from
//! user page base to frame address plus the present / writable / accessed /
//! dirty bits. The paging pipeline consults the accessed bit for its
//! second-chance sweep and the dirty bit for write-back decisions; the
//! user-copy helpers on [`Process`] set both, standing in for the MMU.
//!
//! [`Process`]: crate::task::Process

use super::{Kva, Va};
use alloc::collections::btree_map::BTreeMap;
use bitflags::bitflags;

bitflags! {
    /// Per-mapping state bits.
    pub struct PteFlags: u32 {
        /// The page is mapped.
        const PRESENT  = 1 << 0;
        /// User writes are allowed.
        const WRITABLE = 1 << 1;
        /// The page has been read or written since the bit was cleared.
        const ACCESSED = 1 << 2;
        /// The page has been written since the bit was cleared.
        const DIRTY    = 1 << 3;
    }
}

struct Pte {
    kva: Kva,
    flags: PteFlags,
}

/// A software page directory: user page base → frame mapping with state
/// bits.
pub struct PageDirectory {
    entries: BTreeMap<usize, Pte>,
}

impl PageDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Installs a mapping from page `va` to the frame at `kva`.
    ///
    /// The accessed and dirty bits start cleared.
    pub fn set_page(&mut self, va: Va, kva: Kva, writable: bool) {
        debug_assert!(va.is_page_aligned());
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(va.into_usize(), Pte { kva, flags });
    }

    /// Removes the mapping for page `va`; later user accesses fault.
    pub fn clear_page(&mut self, va: Va) {
        debug_assert!(va.is_page_aligned());
        self.entries.remove(&va.into_usize());
    }

    /// The frame mapped at page `va`, if any.
    pub fn lookup(&self, va: Va) -> Option<Kva> {
        self.entries.get(&va.into_usize()).map(|pte| pte.kva)
    }

    /// Whether page `va` is mapped writable.
    pub fn is_writable(&self, va: Va) -> bool {
        self.entries
            .get(&va.into_usize())
            .is_some_and(|pte| pte.flags.contains(PteFlags::WRITABLE))
    }

    /// Reads the accessed bit of page `va`.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.entries
            .get(&va.into_usize())
            .is_some_and(|pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    /// Writes the accessed bit of page `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va.into_usize()) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// Reads the dirty bit of page `va`.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.entries
            .get(&va.into_usize())
            .is_some_and(|pte| pte.flags.contains(PteFlags::DIRTY))
    }

    /// Writes the dirty bit of page `va`.
    pub fn set_dirty(&mut self, va: Va, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&va.into_usize()) {
            pte.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// Number of live mappings.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PageDirectory;
    use crate::mm::{Kva, Va};

    #[test]
    fn mapping_lifecycle() {
        let mut pd = PageDirectory::new();
        let va = Va(0x1000_0000);
        assert_eq!(pd.lookup(va), None);
        pd.set_page(va, Kva(0xdead_0000), true);
        assert_eq!(pd.lookup(va), Some(Kva(0xdead_0000)));
        assert!(pd.is_writable(va));
        assert!(!pd.is_accessed(va) && !pd.is_dirty(va));
        pd.set_accessed(va, true);
        pd.set_dirty(va, true);
        assert!(pd.is_accessed(va) && pd.is_dirty(va));
        pd.clear_page(va);
        assert_eq!(pd.lookup(va), None);
        assert!(!pd.is_dirty(va));
    }

    #[test]
    fn read_only_mapping() {
        let mut pd = PageDirectory::new();
        let va = Va(0x2000_0000);
        pd.set_page(va, Kva(0xbeef_0000), false);
        assert!(!pd.is_writable(va));
        assert_eq!(pd.mapped_pages(), 1);
    }
}
