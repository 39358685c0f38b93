//! Buffer cache.
//!
//! The buffer cache maps `(device, sector)` pairs to in-memory sector
//! buffers, serving as both an I/O accelerator and the synchronization point
//! for sectors shared between kernel paths. The entry set is bounded to
//! [`CACHE_ENTRIES`] entries; once full, a CLOCK sweep with a persistent
//! hand selects victims, writing dirty buffers back before their entry is
//! reused.
//!
//! ## Locking
//!
//! Two layers of locks allow readers of different sectors to overlap their
//! device I/O:
//!
//! - The **entry set** is guarded by a writer-preferring [`RwLock`]:
//!   lookups and sweeps traverse under the read side, structural mutation
//!   (insert, victim re-key) is exclusive under the write side, and a
//!   waiting mutator gates new traversers so it cannot starve. The clock
//!   hand lives inside the locked set, so mutators cannot race on it.
//! - Each entry pairs a short **slot lock** (a spinlock over key, dirty and
//!   used bits) with a **content lock** (a one-permit [`Semaphore`] over the
//!   sector buffer) that is held across the long device transfer. A reader
//!   pins the entry by cloning its `Arc` while traversing, then blocks on
//!   the content lock after the set lock is gone, and re-checks the key in
//!   case the entry was recycled in between.
//!
//! A dirty victim is flushed *before* its entry is re-keyed, so a
//! concurrent miss on the old sector can never read a stale device image.
//!
//! ## Background work
//!
//! A write-behind worker wakes every [`WRITE_BEHIND_TICKS`] scheduler ticks
//! and writes every dirty buffer back, clearing the dirty bits; it never
//! evicts. A read-ahead worker drains a bounded request channel and
//! populates the cache asynchronously; a full channel drops requests, since
//! duplicated or skipped read-ahead is wasted work, not an error.

use crate::{
    block::{Disk, SECTOR_SIZE, Sector},
    channel::{self, Sender},
    sync::{RwLock, Semaphore, SpinLock},
    thread::Runtime,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;
use log::debug;

/// Upper bound on cached sectors.
pub const CACHE_ENTRIES: usize = 64;

/// Period of the write-behind worker, in scheduler ticks.
pub const WRITE_BEHIND_TICKS: u64 = 1000;

struct EntryMeta {
    /// The sector this entry caches, or `None` for a never-used slot.
    key: Option<(Disk, Sector)>,
    /// The buffer is newer than the on-device sector.
    dirty: bool,
    /// CLOCK reference bit, set on every hit.
    used: bool,
}

struct Entry {
    meta: SpinLock<EntryMeta>,
    /// One-permit content lock; held across device I/O on this entry.
    content: Semaphore,
    data: UnsafeCell<[u8; SECTOR_SIZE]>,
}

// `data` is only touched while `content` is held.
unsafe impl Sync for Entry {}

impl Entry {
    /// The sector buffer.
    ///
    /// # Safety
    /// The caller must hold `content`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn buf(&self) -> &mut [u8; SECTOR_SIZE] {
        unsafe { &mut *self.data.get() }
    }

    fn keyed_to(&self, disk: &Disk, sector: Sector) -> bool {
        let meta = self.meta.lock();
        let hit = meta
            .key
            .as_ref()
            .is_some_and(|(d, s)| d == disk && *s == sector);
        meta.unlock();
        hit
    }
}

struct EntrySet {
    entries: Vec<Arc<Entry>>,
    /// CLOCK hand: index of the next entry to examine.
    hand: usize,
}

struct BufferCacheInner {
    set: RwLock<EntrySet>,
    readahead: SpinLock<Option<Sender<(Disk, Sector)>>>,
    stop: AtomicBool,
    writeback_exited: Semaphore,
    readahead_exited: Semaphore,
}

/// A reference-counted handle to the buffer cache.
#[derive(Clone)]
pub struct BufferCache(Arc<BufferCacheInner>);

impl BufferCache {
    /// Creates the cache and starts its write-behind and read-ahead
    /// workers on `runtime`.
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let (tx, rx) = channel::channel(CACHE_ENTRIES);
        let cache = BufferCache(Arc::new(BufferCacheInner {
            set: RwLock::new(EntrySet {
                entries: Vec::new(),
                hand: 0,
            }),
            readahead: SpinLock::new(Some(tx)),
            stop: AtomicBool::new(false),
            writeback_exited: Semaphore::new(0),
            readahead_exited: Semaphore::new(0),
        }));

        let worker = cache.clone();
        let timer = runtime.clone();
        runtime.spawn(
            "bcache-writeback",
            Box::new(move || {
                debug!("bcache: write-behind worker started");
                loop {
                    timer.sleep(WRITE_BEHIND_TICKS);
                    if worker.0.stop.load(Ordering::Acquire) {
                        break;
                    }
                    worker.flush();
                }
                worker.0.writeback_exited.up();
                debug!("bcache: write-behind worker stopped");
            }),
        );

        let worker = cache.clone();
        runtime.spawn(
            "bcache-readahead",
            Box::new(move || {
                debug!("bcache: read-ahead worker started");
                while let Ok((disk, sector)) = rx.recv() {
                    worker.fetch(&disk, sector);
                }
                worker.0.readahead_exited.up();
                debug!("bcache: read-ahead worker stopped");
            }),
        );

        cache
    }

    /// Reads `buf.len()` bytes of the sector, starting `offset` bytes in.
    ///
    /// Returns whether the sector was already cached.
    pub fn read(&self, disk: &Disk, sector: Sector, buf: &mut [u8], offset: usize) -> bool {
        debug_assert!(offset + buf.len() <= SECTOR_SIZE);
        let (entry, hit) = self.pin(disk, sector);
        let data = unsafe { entry.buf() };
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        entry.content.up();
        hit
    }

    /// Writes `buf.len()` bytes into the sector's buffer, starting `offset`
    /// bytes in. The entry is marked dirty; the device sector is not written
    /// synchronously.
    ///
    /// Returns whether the sector was already cached.
    pub fn write(&self, disk: &Disk, sector: Sector, buf: &[u8], offset: usize) -> bool {
        debug_assert!(offset + buf.len() <= SECTOR_SIZE);
        let (entry, hit) = self.pin(disk, sector);
        let data = unsafe { entry.buf() };
        data[offset..offset + buf.len()].copy_from_slice(buf);
        let mut meta = entry.meta.lock();
        meta.dirty = true;
        meta.unlock();
        entry.content.up();
        hit
    }

    /// Schedules an asynchronous populating read of the sector.
    ///
    /// Duplicate requests and requests dropped under load are permitted;
    /// read-ahead is an optimization, never a correctness requirement.
    pub fn read_ahead(&self, disk: &Disk, sector: Sector) {
        let guard = self.0.readahead.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send((disk.clone(), sector));
        }
        guard.unlock();
    }

    /// Writes every dirty buffer back to its device and clears the dirty
    /// bits. Entries stay cached.
    pub fn flush(&self) {
        let set = self.0.set.read();
        let entries: Vec<Arc<Entry>> = set.entries.clone();
        set.unlock();

        for entry in entries {
            entry.content.down();
            let meta = entry.meta.lock();
            let target = if meta.dirty { meta.key.clone() } else { None };
            meta.unlock();
            if let Some((disk, sector)) = target {
                let data = unsafe { entry.buf() };
                if disk.write(sector, data).is_err() {
                    panic!("bcache: write-back of {disk:?} sector {sector:?} failed");
                }
                let mut meta = entry.meta.lock();
                meta.dirty = false;
                meta.unlock();
            }
            entry.content.up();
        }
    }

    /// Stops both workers, flushes every dirty buffer, and frees all
    /// entries. The cache must not be used afterwards.
    pub fn shutdown(&self) {
        self.0.stop.store(true, Ordering::Release);
        let mut guard = self.0.readahead.lock();
        let tx = guard.take();
        guard.unlock();
        drop(tx);
        self.0.readahead_exited.down();
        self.0.writeback_exited.down();

        self.flush();
        let mut set = self.0.set.write();
        set.entries.clear();
        set.hand = 0;
        set.unlock();
        debug!("bcache: shut down");
    }

    /// Populates the cache without copying anywhere (read-ahead body).
    fn fetch(&self, disk: &Disk, sector: Sector) {
        let (entry, _) = self.pin(disk, sector);
        entry.content.up();
    }

    /// Returns the entry caching `(disk, sector)` with its content lock
    /// held and its buffer populated, plus whether this was a cache hit.
    fn pin(&self, disk: &Disk, sector: Sector) -> (Arc<Entry>, bool) {
        let backoff = Backoff::new();
        loop {
            // Traversal flow: look for the sector, marking the hit used.
            let set = self.0.set.read();
            let mut found = None;
            for entry in &set.entries {
                let mut meta = entry.meta.lock();
                let hit = meta
                    .key
                    .as_ref()
                    .is_some_and(|(d, s)| d == disk && *s == sector);
                if hit {
                    meta.used = true;
                }
                meta.unlock();
                if hit {
                    found = Some(entry.clone());
                    break;
                }
            }
            set.unlock();

            if let Some(entry) = found {
                entry.content.down();
                // The entry may have been recycled between dropping the set
                // lock and acquiring its content.
                if entry.keyed_to(disk, sector) {
                    return (entry, true);
                }
                entry.content.up();
                continue;
            }

            // Modification flow: insert a fresh entry or claim a victim.
            let mut set = self.0.set.write();
            if set.entries.iter().any(|e| e.keyed_to(disk, sector)) {
                // Lost the race against another miss on the same sector.
                set.unlock();
                continue;
            }
            let entry = if set.entries.len() < CACHE_ENTRIES {
                let entry = Arc::new(Entry {
                    meta: SpinLock::new(EntryMeta {
                        key: Some((disk.clone(), sector)),
                        dirty: false,
                        used: false,
                    }),
                    // Created locked; released once populated.
                    content: Semaphore::new(0),
                    data: UnsafeCell::new([0; SECTOR_SIZE]),
                });
                set.entries.push(entry.clone());
                Some(entry)
            } else {
                Self::claim_victim(&mut set, disk, sector)
            };
            set.unlock();

            let Some(entry) = entry else {
                // Every entry is pinned right now; try again shortly.
                backoff.snooze();
                continue;
            };

            let data = unsafe { entry.buf() };
            if disk.read(sector, data).is_err() {
                panic!("bcache: read of {disk:?} sector {sector:?} failed");
            }
            return (entry, false);
        }
    }

    /// Runs the CLOCK sweep and re-keys the victim to `(disk, sector)`.
    ///
    /// Called with the entry set write-locked. On success the victim's
    /// content lock is held by the caller and its previous dirty contents
    /// have been written back. Returns `None` when every entry is pinned.
    fn claim_victim(set: &mut EntrySet, disk: &Disk, sector: Sector) -> Option<Arc<Entry>> {
        let n = set.entries.len();
        // One pass can clear every reference bit; a second then must find a
        // victim unless all entries are pinned by concurrent readers.
        for _ in 0..2 * n {
            let entry = set.entries[set.hand].clone();
            set.hand = (set.hand + 1) % n;

            let mut meta = entry.meta.lock();
            if meta.used {
                meta.used = false;
                meta.unlock();
                continue;
            }
            if entry.content.try_down().is_err() {
                // In the middle of someone else's I/O; skip it.
                meta.unlock();
                continue;
            }
            let old = meta.key.take();
            let dirty = meta.dirty;
            meta.key = Some((disk.clone(), sector));
            meta.dirty = false;
            meta.used = false;
            meta.unlock();

            if dirty {
                if let Some((old_disk, old_sector)) = old {
                    let data = unsafe { entry.buf() };
                    if old_disk.write(old_sector, data).is_err() {
                        panic!("bcache: eviction write-back of sector {old_sector:?} failed");
                    }
                }
            }
            return Some(entry);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferCache, CACHE_ENTRIES};
    use crate::block::{Disk, MemDisk, SECTOR_SIZE, Sector};
    use crate::thread::Runtime;
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

    fn cache_and_disk(sectors: usize) -> (BufferCache, Disk) {
        let cache = BufferCache::new(Arc::new(TestRuntime));
        let disk = Disk::new(0, Arc::new(MemDisk::new(sectors)));
        (cache, disk)
    }

    #[test]
    fn hit_after_miss() {
        let (cache, disk) = cache_and_disk(8);
        let mut byte = [0u8];
        assert!(!cache.read(&disk, Sector(3), &mut byte, 0));
        assert!(cache.read(&disk, Sector(3), &mut byte, 0));
        cache.shutdown();
    }

    struct SlowTickRuntime;

    impl Runtime for SlowTickRuntime {
        fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>) {
            std::thread::Builder::new()
                .name(name.into())
                .spawn(body)
                .unwrap();
        }

        fn sleep(&self, ticks: u64) {
            std::thread::sleep(std::time::Duration::from_millis(ticks));
        }
    }

    #[test]
    fn write_is_deferred_until_flush() {
        // Slow ticks keep the write-behind worker far away from the
        // assertions below.
        let cache = BufferCache::new(Arc::new(SlowTickRuntime));
        let disk = Disk::new(0, Arc::new(MemDisk::new(8)));
        cache.write(&disk, Sector(1), &[0xAA; 4], 100);
        // The device still holds zeroes until a flush happens.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(1), &mut raw).unwrap();
        assert_eq!(raw[100], 0);
        cache.flush();
        disk.read(Sector(1), &mut raw).unwrap();
        assert_eq!(&raw[100..104], &[0xAA; 4]);
        cache.shutdown();
    }

    #[test]
    fn clock_replaces_oldest_unused_entry() {
        let (cache, disk) = cache_and_disk(CACHE_ENTRIES + 8);
        let mut byte = [0u8];
        // Fill all 64 entries with sectors 0..=63.
        for s in 0..CACHE_ENTRIES {
            assert!(!cache.read(&disk, Sector(s), &mut byte, 0));
        }
        // Sector 64 misses; the sweep clears every reference bit and
        // replaces the entry for sector 0.
        assert!(!cache.read(&disk, Sector(CACHE_ENTRIES), &mut byte, 0));
        assert!(
            cache.read(&disk, Sector(1), &mut byte, 0),
            "sector 1 must still be cached after a single replacement"
        );
        assert!(
            !cache.read(&disk, Sector(0), &mut byte, 0),
            "sector 0 must have been chosen as the victim"
        );
        cache.shutdown();
    }

    #[test]
    fn eviction_writes_dirty_victim_back() {
        let (cache, disk) = cache_and_disk(CACHE_ENTRIES * 3);
        cache.write(&disk, Sector(0), &[0x5A; SECTOR_SIZE], 0);
        let mut byte = [0u8];
        // Push enough other sectors through to evict sector 0 twice over.
        for s in 1..=2 * CACHE_ENTRIES {
            cache.read(&disk, Sector(s), &mut byte, 0);
        }
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(0), &mut raw).unwrap();
        assert_eq!(raw, [0x5A; SECTOR_SIZE]);
        cache.shutdown();
    }

    #[test]
    fn write_behind_worker_flushes_periodically() {
        let (cache, disk) = cache_and_disk(8);
        cache.write(&disk, Sector(2), &[0x77; 8], 0);
        let mut raw = [0u8; SECTOR_SIZE];
        // One worker period is 1000 ticks = 20ms of test time.
        for _ in 0..500 {
            disk.read(Sector(2), &mut raw).unwrap();
            if raw[0] == 0x77 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(&raw[..8], &[0x77; 8]);
        cache.shutdown();
    }

    #[test]
    fn concurrent_readers_and_writers_agree() {
        let (cache, disk) = cache_and_disk(CACHE_ENTRIES / 2);
        let mut handles = alloc::vec::Vec::new();
        for t in 0..4u8 {
            let cache = cache.clone();
            let disk = disk.clone();
            handles.push(std::thread::spawn(move || {
                let sector = Sector(t as usize);
                for i in 0..200u32 {
                    let val = [t, i as u8];
                    cache.write(&disk, sector, &val, 0);
                    let mut out = [0u8; 2];
                    cache.read(&disk, sector, &mut out, 0);
                    assert_eq!(out, val);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        cache.shutdown();
    }

    #[test]
    fn read_ahead_populates_in_background() {
        use crate::block::BlockDevice;
        use core::sync::atomic::{AtomicUsize, Ordering};

        struct CountingDisk {
            inner: MemDisk,
            reads: AtomicUsize,
        }
        impl BlockDevice for CountingDisk {
            fn read(
                &self,
                sector: Sector,
                buf: &mut [u8; SECTOR_SIZE],
            ) -> Result<(), crate::KernelError> {
                self.reads.fetch_add(1, Ordering::SeqCst);
                self.inner.read(sector, buf)
            }
            fn write(
                &self,
                sector: Sector,
                buf: &[u8; SECTOR_SIZE],
            ) -> Result<(), crate::KernelError> {
                self.inner.write(sector, buf)
            }
            fn sector_count(&self) -> usize {
                self.inner.sector_count()
            }
        }

        let dev = Arc::new(CountingDisk {
            inner: MemDisk::new(8),
            reads: AtomicUsize::new(0),
        });
        let cache = BufferCache::new(Arc::new(TestRuntime));
        let disk = Disk::new(0, dev.clone());

        cache.read_ahead(&disk, Sector(5));
        // Wait until the background worker has pulled the sector in.
        for _ in 0..500 {
            if dev.reads.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(dev.reads.load(Ordering::SeqCst), 1);
        let mut byte = [0u8];
        assert!(
            cache.read(&disk, Sector(5), &mut byte, 0),
            "a sector populated by read-ahead must answer with a hit"
        );
        assert_eq!(dev.reads.load(Ordering::SeqCst), 1);
        cache.shutdown();
    }
}
