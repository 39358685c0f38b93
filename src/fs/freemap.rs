//! Free-sector map.
//!
//! A bitmap over the filesystem device: bit `i` is set iff sector `i` is
//! allocated. The map persists itself to a run of well-known sectors at the
//! front of the device, which it marks allocated on format so no file can
//! ever claim them.

use crate::{
    KernelError,
    bcache::BufferCache,
    block::{Disk, SECTOR_SIZE, Sector},
    sync::SpinLock,
    util::Bitmap,
};
use alloc::vec::Vec;
use log::debug;

/// First sector of the persisted bitmap.
pub const FREE_MAP_START: Sector = Sector(0);

/// In-core free-sector map.
pub struct FreeMap {
    inner: SpinLock<Bitmap>,
    sectors: usize,
}

impl FreeMap {
    /// Sectors needed to persist a bitmap covering `sectors` sectors.
    fn map_sectors(sectors: usize) -> usize {
        sectors.div_ceil(8).div_ceil(SECTOR_SIZE)
    }

    /// The well-known sector range holding the persisted bitmap.
    pub fn reserved(sectors: usize) -> core::ops::Range<usize> {
        let start = FREE_MAP_START.into_usize();
        start..start + Self::map_sectors(sectors)
    }

    /// Builds a fresh map for `disk`: everything free except the map's own
    /// well-known sectors.
    pub fn format(disk: &Disk) -> Self {
        let sectors = disk.sector_count();
        let mut bitmap = Bitmap::new(sectors);
        for s in Self::reserved(sectors) {
            bitmap.mark(s);
        }
        debug!(
            "freemap: formatted, {} of {} sectors reserved",
            Self::map_sectors(sectors),
            sectors
        );
        Self {
            inner: SpinLock::new(bitmap),
            sectors,
        }
    }

    /// Loads the persisted map from `disk` through the buffer cache.
    pub fn load(cache: &BufferCache, disk: &Disk) -> Self {
        let sectors = disk.sector_count();
        let mut raw: Vec<u8> = Vec::new();
        for s in Self::reserved(sectors) {
            let mut sector_buf = [0u8; SECTOR_SIZE];
            cache.read(disk, Sector(s), &mut sector_buf, 0);
            raw.extend_from_slice(&sector_buf);
        }
        let mut bitmap = Bitmap::new(sectors);
        let words: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        bitmap.restore(&words);
        Self {
            inner: SpinLock::new(bitmap),
            sectors,
        }
    }

    /// Persists the map to its well-known sectors through the buffer cache.
    pub fn flush(&self, cache: &BufferCache, disk: &Disk) {
        let guard = self.inner.lock();
        let mut raw: Vec<u8> = guard.words().iter().flat_map(|w| w.to_le_bytes()).collect();
        guard.unlock();
        raw.resize(Self::map_sectors(self.sectors) * SECTOR_SIZE, 0);
        for (i, chunk) in raw.chunks_exact(SECTOR_SIZE).enumerate() {
            cache.write(disk, FREE_MAP_START + i, chunk, 0);
        }
    }

    /// Allocates one sector.
    pub fn allocate(&self) -> Result<Sector, KernelError> {
        let mut guard = self.inner.lock();
        let found = guard.scan_and_flip(1, 1);
        guard.unlock();
        found.map(Sector).ok_or(KernelError::NoSpace)
    }

    /// Claims a specific sector (a well-known location such as a root
    /// inode).
    pub fn allocate_at(&self, sector: Sector) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let taken = guard.test(sector.into_usize());
        if !taken {
            guard.mark(sector.into_usize());
        }
        guard.unlock();
        if taken {
            Err(KernelError::FileExist)
        } else {
            Ok(())
        }
    }

    /// Returns `sector` to the map.
    ///
    /// Releasing a sector that is not allocated indicates a corrupted map
    /// and panics.
    pub fn release(&self, sector: Sector) {
        let mut guard = self.inner.lock();
        if !guard.test(sector.into_usize()) {
            panic!("freemap: double release of sector {sector:?}");
        }
        guard.reset(sector.into_usize());
        guard.unlock();
    }

    /// Whether `sector` is currently allocated.
    pub fn is_allocated(&self, sector: Sector) -> bool {
        let guard = self.inner.lock();
        let v = guard.test(sector.into_usize());
        guard.unlock();
        v
    }

    /// Number of allocated sectors.
    pub fn allocated_count(&self) -> usize {
        let guard = self.inner.lock();
        let v = guard.count();
        guard.unlock();
        v
    }
}
