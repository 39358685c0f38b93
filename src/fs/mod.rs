//! Filesystem core: on-disk inodes behind a shared buffer cache.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ fs::Inode                   │  byte-granular read_at / write_at,
//! │                             │  lazy growth, deny-write stack
//! └─────────────┬───────────────┘
//!               │
//! ┌─────────────▼───────────────┐
//! │ fs::FilesysInner            │  open-inode registry, create / open /
//! │                             │  close / remove, free-sector map
//! └─────────────┬───────────────┘
//!               │
//! ┌─────────────▼───────────────┐
//! │ bcache::BufferCache         │  sector-granular caching, write-behind
//! └─────────────┬───────────────┘
//!               │
//! ┌─────────────▼───────────────┐
//! │ block::Disk                 │  512-byte sectors
//! └─────────────────────────────┘
//! ```
//!
//! The registry guarantees a single in-memory [`Inode`] per inode sector.
//! Opening bumps its reference count; closing drops it, and the last close
//! of a removed inode releases every sector the file owned.

pub mod disk_layout;
pub mod freemap;
pub mod inode;

use crate::{
    KernelError,
    bcache::BufferCache,
    block::{Disk, Sector},
    sync::{RwLock, SpinLock},
};
use alloc::{
    collections::btree_map::{BTreeMap, Entry},
    sync::Arc,
};
use core::ops::Deref;
use disk_layout::DiskInode;
use freemap::FreeMap;
pub use inode::Inode;
use log::info;

/// Internal state of a mounted filesystem.
pub struct FilesysInner {
    pub(crate) disk: Disk,
    pub(crate) cache: BufferCache,
    pub(crate) freemap: FreeMap,
    inodes: SpinLock<BTreeMap<usize, Arc<Inode>>>,
}

/// A reference-counted handle to a mounted filesystem.
#[derive(Clone)]
pub struct Filesys(pub Arc<FilesysInner>);

impl Deref for Filesys {
    type Target = Arc<FilesysInner>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Filesys {
    /// Formats `disk` with an empty free map and mounts it.
    pub fn format(disk: Disk, cache: BufferCache) -> Self {
        let freemap = FreeMap::format(&disk);
        freemap.flush(&cache, &disk);
        info!("filesys: formatted {:?}", disk);
        Filesys(Arc::new(FilesysInner {
            disk,
            cache,
            freemap,
            inodes: SpinLock::new(BTreeMap::new()),
        }))
    }

    /// Mounts a previously formatted `disk`, loading its free map.
    pub fn mount(disk: Disk, cache: BufferCache) -> Self {
        let freemap = FreeMap::load(&cache, &disk);
        info!(
            "filesys: mounted {:?}, {} sectors allocated",
            disk,
            freemap.allocated_count()
        );
        Filesys(Arc::new(FilesysInner {
            disk,
            cache,
            freemap,
            inodes: SpinLock::new(BTreeMap::new()),
        }))
    }

    /// Persists the free map and shuts the buffer cache down, flushing
    /// every dirty sector. The filesystem must not be used afterwards.
    pub fn shutdown(&self) {
        self.0.freemap.flush(&self.0.cache, &self.0.disk);
        self.0.cache.shutdown();
        info!("filesys: shut down");
    }

    /// Opens the inode stored at `sector`, bumping its reference count if
    /// it is already open.
    pub fn open(&self, sector: Sector) -> Result<Arc<Inode>, KernelError> {
        let inner = &self.0;
        loop {
            let registry = inner.inodes.lock();
            let existing = registry.get(&sector.into_usize()).cloned();
            registry.unlock();

            if let Some(inode) = existing {
                // The inode may be in the middle of its last close; only a
                // live opener count keeps it valid.
                let mut state = inode.state.write();
                if state.open_count == 0 {
                    state.unlock();
                    continue;
                }
                state.open_count += 1;
                state.unlock();
                return Ok(inode);
            }

            let d = DiskInode::load(&inner.cache, &inner.disk, sector)?;
            let inode = Arc::new(Inode {
                sector,
                fs: Arc::downgrade(inner),
                state: RwLock::new(inode::InodeState {
                    open_count: 1,
                    removed: false,
                    deny_write_count: 0,
                    disk: d,
                }),
            });
            let mut registry = inner.inodes.lock();
            match registry.entry(sector.into_usize()) {
                Entry::Occupied(_) => {
                    // Raced against another opener; use theirs.
                    registry.unlock();
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(inode.clone());
                    registry.unlock();
                    return Ok(inode);
                }
            }
        }
    }
}

impl FilesysInner {
    /// The buffer cache this filesystem runs on.
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// The underlying device.
    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    /// The free-sector map.
    pub fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    /// Writes a fresh inode of `length` bytes to `sector`, allocating and
    /// zero-filling every data and indirect sector.
    ///
    /// On any allocation failure every sector allocated so far is released
    /// and nothing has been persisted.
    pub fn create(&self, sector: Sector, length: usize) -> Result<(), KernelError> {
        let mut d = DiskInode::new();
        if length > 0 {
            inode::grow(self, sector, &mut d, length)?;
        } else {
            d.store(&self.cache, &self.disk, sector);
        }
        Ok(())
    }

    /// Bumps the reference count of an already open inode.
    pub fn reopen(&self, inode: &Arc<Inode>) {
        let mut state = inode.state.write();
        debug_assert!(state.open_count > 0);
        state.open_count += 1;
        state.unlock();
    }

    /// Drops one reference. On last close the inode leaves the registry,
    /// and a removed inode releases all of its sectors to the free map.
    pub fn close(&self, inode: &Arc<Inode>) {
        let mut state = inode.state.write();
        debug_assert!(state.open_count > 0);
        state.open_count -= 1;
        if state.open_count == 0 {
            let mut registry = self.inodes.lock();
            registry.remove(&inode.sector.into_usize());
            registry.unlock();
            if state.removed {
                inode::release_blocks(self, &state.disk);
                self.freemap.release(inode.sector);
            }
        }
        state.unlock();
    }

    /// Marks the inode deleted; its sectors are released when the last
    /// opener closes it.
    pub fn remove(&self, inode: &Arc<Inode>) {
        let mut state = inode.state.write();
        state.removed = true;
        state.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::Filesys;
    use crate::bcache::BufferCache;
    use crate::block::{Disk, MemDisk, SECTOR_SIZE, Sector};
    use crate::fs::disk_layout::{DIRECT_PTRS, INDIRECT_PTRS, MAX_FILE_SECTORS};
    use crate::thread::Runtime;
    use crate::KernelError;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    struct TestRuntime;
    impl Runtime for TestRuntime {
        fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) {
            std::thread::Builder::new()
                .name(name.into())
                .spawn(body)
                .unwrap();
        }
        fn sleep(&self, ticks: u64) {
            std::thread::sleep(std::time::Duration::from_micros(ticks * 20));
        }
    }

    fn fresh_fs(sectors: usize) -> Filesys {
        let cache = BufferCache::new(Arc::new(TestRuntime));
        let disk = Disk::new(0, Arc::new(MemDisk::new(sectors)));
        Filesys::format(disk, cache)
    }

    #[test]
    fn create_open_read_zeroes() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 3000).unwrap();
        let inode = fs.open(sector).unwrap();
        assert_eq!(inode.length(), 3000);
        let mut buf = [0xFFu8; 3000];
        assert_eq!(inode.read_at(&mut buf, 0).unwrap(), 3000);
        assert!(buf.iter().all(|&b| b == 0));
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn write_read_round_trip_across_sectors() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 0).unwrap();
        let inode = fs.open(sector).unwrap();

        // Spans the boundary between two sectors.
        let data: alloc::vec::Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        assert_eq!(inode.write_at(&data, SECTOR_SIZE - 100).unwrap(), 200);
        assert_eq!(inode.length(), SECTOR_SIZE + 100);

        let mut out = [0u8; 200];
        assert_eq!(inode.read_at(&mut out, SECTOR_SIZE - 100).unwrap(), 200);
        assert_eq!(out[..], data[..]);
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn reads_stop_at_end_of_file() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 100).unwrap();
        let inode = fs.open(sector).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(inode.read_at(&mut buf, 80).unwrap(), 20);
        assert_eq!(inode.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(inode.read_at(&mut buf, 5000).unwrap(), 0);
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn growth_reaches_each_pointer_tier() {
        // Enough sectors for the doubly-indirect boundary plus metadata.
        let fs = fresh_fs((DIRECT_PTRS + INDIRECT_PTRS) * 2 + 300);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 0).unwrap();
        let inode = fs.open(sector).unwrap();

        let byte = [0xA5u8];
        // Exactly the direct tier.
        assert_eq!(
            inode.write_at(&byte, DIRECT_PTRS * SECTOR_SIZE - 1).unwrap(),
            1
        );
        // Exactly the singly-indirect tier.
        assert_eq!(
            inode
                .write_at(&byte, (DIRECT_PTRS + INDIRECT_PTRS) * SECTOR_SIZE - 1)
                .unwrap(),
            1
        );
        // First byte of the doubly-indirect tier.
        assert_eq!(
            inode
                .write_at(&byte, (DIRECT_PTRS + INDIRECT_PTRS) * SECTOR_SIZE)
                .unwrap(),
            1
        );
        let mut out = [0u8];
        inode
            .read_at(&mut out, (DIRECT_PTRS + INDIRECT_PTRS) * SECTOR_SIZE)
            .unwrap();
        assert_eq!(out[0], 0xA5);
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn growth_past_max_file_size_fails_cleanly() {
        let fs = fresh_fs(256);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 0).unwrap();
        let inode = fs.open(sector).unwrap();
        let before = fs.freemap().allocated_count();

        // One byte past the absolute maximum must fail without touching the
        // free map, regardless of device size.
        let huge = [0u8];
        let written = inode
            .write_at(&huge, MAX_FILE_SECTORS * SECTOR_SIZE)
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(fs.freemap().allocated_count(), before);
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn create_rolls_back_on_full_device() {
        let fs = fresh_fs(64);
        let sector = fs.freemap().allocate().unwrap();
        let before = fs.freemap().allocated_count();
        // Needs far more sectors than the device has.
        assert_eq!(
            fs.create(sector, 200 * SECTOR_SIZE),
            Err(KernelError::NoSpace)
        );
        assert_eq!(fs.freemap().allocated_count(), before);
        fs.shutdown();
    }

    #[test]
    fn partial_write_keeps_prefix_when_disk_fills() {
        let fs = fresh_fs(128);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 0).unwrap();
        let inode = fs.open(sector).unwrap();

        let data = alloc::vec![0x42u8; 512 * 1024];
        let written = inode.write_at(&data, 0).unwrap();
        assert!(written > 0 && written < data.len());
        assert_eq!(inode.length(), written);

        // Every byte of the accepted prefix reads back.
        let mut out = alloc::vec![0u8; written];
        assert_eq!(inode.read_at(&mut out, 0).unwrap(), written);
        assert!(out.iter().all(|&b| b == 0x42));

        // Nothing beyond the prefix is held in the free map: releasing the
        // file frees everything except the persisted map itself and the
        // inode sector.
        fs.remove(&inode);
        fs.close(&inode);
        assert_eq!(
            fs.freemap().allocated_count(),
            super::FreeMap::reserved(128).len()
        );
        fs.shutdown();
    }

    #[test]
    fn deny_write_blocks_writers_until_allowed() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 100).unwrap();
        let inode = fs.open(sector).unwrap();
        inode.deny_write();
        assert_eq!(inode.write_at(&[1, 2, 3], 0).unwrap(), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(&[1, 2, 3], 0).unwrap(), 3);
        fs.close(&inode);
        fs.shutdown();
    }

    #[test]
    fn remove_defers_release_until_last_close() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 10 * SECTOR_SIZE).unwrap();
        let baseline = fs.freemap().allocated_count();

        let a = fs.open(sector).unwrap();
        let b = fs.open(sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "one in-memory inode per sector");
        assert_eq!(a.open_count(), 2);

        fs.remove(&a);
        fs.close(&a);
        // Still open through `b`; nothing released yet.
        assert_eq!(fs.freemap().allocated_count(), baseline);
        fs.close(&b);
        // Data sectors and the inode sector itself are gone.
        assert_eq!(fs.freemap().allocated_count(), baseline - 11);
        fs.shutdown();
    }

    #[test]
    fn reopen_after_close_reloads_from_disk() {
        let fs = fresh_fs(1024);
        let sector = fs.freemap().allocate().unwrap();
        fs.create(sector, 0).unwrap();
        let inode = fs.open(sector).unwrap();
        inode.write_at(&[0xAB], 4095).unwrap();
        fs.close(&inode);

        let inode = fs.open(sector).unwrap();
        assert_eq!(inode.length(), 4096);
        let mut out = [0u8];
        inode.read_at(&mut out, 4095).unwrap();
        assert_eq!(out[0], 0xAB);
        fs.close(&inode);
        fs.shutdown();
    }
}
