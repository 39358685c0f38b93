//! Swap table.
//!
//! Swap space is a dedicated block device carved into slots of 8 contiguous
//! sectors, each holding one evicted page. The slot bitmap lives only in
//! memory and is recreated empty on every boot; there is no on-disk swap
//! header. Swap I/O bypasses the buffer cache.

use crate::{
    block::{Disk, SECTOR_SIZE, Sector},
    mm::{self, Kva, PAGE_SIZE},
    sync::SpinLock,
    util::Bitmap,
};
use log::debug;

/// Sectors per swap slot: one page.
pub const SLOT_SECTORS: usize = PAGE_SIZE / SECTOR_SIZE;

/// A swap slot: 8 contiguous sectors aligned to 8, identified by the first.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SwapSlot(Sector);

impl SwapSlot {
    /// First sector of the slot.
    #[inline]
    pub fn start(self) -> Sector {
        self.0
    }
}

/// Allocator and mover for swap slots.
pub struct SwapTable {
    disk: Disk,
    map: SpinLock<Bitmap>,
}

impl SwapTable {
    /// Takes ownership of the swap device and sizes the slot bitmap to it.
    pub fn new(disk: Disk) -> Self {
        let sectors = disk.sector_count();
        debug!("swap: {} sectors, {} slots", sectors, sectors / SLOT_SECTORS);
        Self {
            disk,
            map: SpinLock::new(Bitmap::new(sectors)),
        }
    }

    /// Writes the page at `kva` to a freshly allocated slot.
    ///
    /// Panics when swap is exhausted: the caller holds the victim frame and
    /// there is no useful recovery path.
    pub fn write(&self, kva: Kva) -> SwapSlot {
        let mut map = self.map.lock();
        let start = map.scan_and_flip(SLOT_SECTORS, SLOT_SECTORS);
        map.unlock();
        let Some(start) = start else {
            panic!("swap: out of swap slots");
        };
        debug_assert!(start % SLOT_SECTORS == 0);

        let data = unsafe { mm::page_bytes(kva) };
        for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            let chunk: &[u8; SECTOR_SIZE] = chunk.try_into().unwrap();
            if self.disk.write(Sector(start + i), chunk).is_err() {
                panic!("swap: write to sector {} failed", start + i);
            }
        }
        SwapSlot(Sector(start))
    }

    /// Reads the slot's page into `kva` and frees the slot.
    pub fn read(&self, slot: SwapSlot, kva: Kva) {
        let start = slot.start().into_usize();
        let data = unsafe { mm::page_bytes(kva) };
        for (i, chunk) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let chunk: &mut [u8; SECTOR_SIZE] = chunk.try_into().unwrap();
            if self.disk.read(Sector(start + i), chunk).is_err() {
                panic!("swap: read of sector {} failed", start + i);
            }
        }
        self.free(slot);
    }

    /// Releases the slot's 8 sectors.
    pub fn free(&self, slot: SwapSlot) {
        let start = slot.start().into_usize();
        let mut map = self.map.lock();
        if !map.all(start, SLOT_SECTORS) {
            panic!("swap: freeing unallocated slot at sector {start}");
        }
        map.set_range(start, SLOT_SECTORS, false);
        map.unlock();
    }

    /// Number of sectors currently holding swapped pages.
    pub fn used_sectors(&self) -> usize {
        let map = self.map.lock();
        let n = map.count();
        map.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::{SLOT_SECTORS, SwapTable};
    use crate::block::{Disk, MemDisk};
    use crate::mm::UserPool;
    use alloc::sync::Arc;

    fn swap_table(sectors: usize) -> SwapTable {
        SwapTable::new(Disk::new(1, Arc::new(MemDisk::new(sectors))))
    }

    #[test]
    fn round_trips_a_page() {
        let swap = swap_table(64);
        let pool = UserPool::new(2);
        let mut page = pool.alloc(true).unwrap();
        page.inner_mut().iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);

        let slot = swap.write(page.kva());
        assert_eq!(swap.used_sectors(), SLOT_SECTORS);

        let target = pool.alloc(true).unwrap();
        swap.read(slot, target.kva());
        assert_eq!(swap.used_sectors(), 0, "read frees the slot");
        assert!(target.inner().iter().enumerate().all(|(i, &b)| b == i as u8));
    }

    #[test]
    fn slots_are_page_aligned_and_distinct() {
        let swap = swap_table(64);
        let pool = UserPool::new(1);
        let page = pool.alloc(true).unwrap();
        let a = swap.write(page.kva());
        let b = swap.write(page.kva());
        assert_ne!(a, b);
        assert_eq!(a.start().into_usize() % SLOT_SECTORS, 0);
        assert_eq!(b.start().into_usize() % SLOT_SECTORS, 0);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn exhaustion_panics() {
        let swap = swap_table(SLOT_SECTORS);
        let pool = UserPool::new(1);
        let page = pool.alloc(true).unwrap();
        let _ = swap.write(page.kva());
        let _ = swap.write(page.kva());
    }
}
