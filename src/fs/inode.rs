//! In-memory inodes and byte-granular file I/O.
//!
//! An inode maps byte offsets to device sectors through three tiers of
//! pointers: 124 direct, one indirect sector of 128 pointers, and one
//! doubly-indirect sector of 128 indirect sectors. `length` is the
//! authoritative byte count; every sector index below
//! `length.div_ceil(SECTOR_SIZE)` resolves to a real sector.
//!
//! Writes past the end grow the file sector by sector as the write
//! proceeds, so an out-of-disk condition keeps the successfully written
//! prefix. Each individual growth step is transactional: it either commits
//! (pointers written, `length` updated, disk inode rewritten) or releases
//! every sector it allocated and leaves the on-disk structure untouched.

use super::{
    FilesysInner,
    disk_layout::{DIRECT_PTRS, DiskInode, INDIRECT_PTRS, IndirectBlock, MAX_FILE_SECTORS, RawSector},
};
use crate::{
    KernelError,
    block::{SECTOR_SIZE, Sector},
    sync::RwLock,
};
use alloc::{collections::btree_map::BTreeMap, sync::Weak, vec::Vec};
use log::debug;

pub(super) struct InodeState {
    pub open_count: usize,
    pub removed: bool,
    pub deny_write_count: usize,
    pub disk: DiskInode,
}

/// An open inode.
///
/// At most one `Inode` exists per inode sector; the open-inode registry in
/// [`FilesysInner`] hands out clones of the same `Arc` and tracks the opener
/// count explicitly, since openers and holders of the memory are not the
/// same thing (a removed file's sectors are released on last *close*).
pub struct Inode {
    pub(super) sector: Sector,
    pub(super) fs: Weak<FilesysInner>,
    pub(super) state: RwLock<InodeState>,
}

impl Inode {
    fn fs(&self) -> Result<alloc::sync::Arc<FilesysInner>, KernelError> {
        self.fs.upgrade().ok_or(KernelError::IOError)
    }

    /// Sector holding this inode's on-disk structure; doubles as its
    /// identity.
    #[inline]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Length of the file in bytes.
    pub fn length(&self) -> usize {
        let state = self.state.read();
        let len = state.disk.length as usize;
        state.unlock();
        len
    }

    /// Current opener count.
    pub fn open_count(&self) -> usize {
        let state = self.state.read();
        let n = state.open_count;
        state.unlock();
        n
    }

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes actually read, which is smaller than
    /// requested when the range crosses end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let fs = self.fs()?;
        let state = self.state.read();
        let length = state.disk.length as usize;
        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let pos = offset + bytes_read;
            if pos >= length {
                break;
            }
            let sector = byte_to_sector(&fs, &state.disk, pos)
                .unwrap_or_else(|| panic!("inode {:?}: hole below length", self.sector));
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - bytes_read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            fs.cache.read(
                &fs.disk,
                sector,
                &mut buf[bytes_read..bytes_read + chunk],
                sector_ofs,
            );
            // Prime the cache with the sector that a sequential reader
            // touches next.
            let next = (pos / SECTOR_SIZE + 1) * SECTOR_SIZE;
            if next < length {
                if let Some(next_sector) = byte_to_sector(&fs, &state.disk, next) {
                    fs.cache.read_ahead(&fs.disk, next_sector);
                }
            }
            bytes_read += chunk;
        }
        state.unlock();
        Ok(bytes_read)
    }

    /// Writes up to `buf.len()` bytes starting at `offset`, growing the
    /// file when the range extends past end of file.
    ///
    /// Returns the number of bytes actually written: 0 while writes are
    /// denied, and a short count when the device fills up mid-growth.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs()?;
        let mut state = self.state.write();
        if state.deny_write_count > 0 {
            state.unlock();
            return Ok(0);
        }
        let mut bytes_written = 0;
        while bytes_written < buf.len() {
            let pos = offset + bytes_written;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - bytes_written).min(SECTOR_SIZE - sector_ofs);
            if pos + chunk > state.disk.length as usize
                && grow(&fs, self.sector, &mut state.disk, pos + chunk).is_err()
            {
                break;
            }
            let sector = byte_to_sector(&fs, &state.disk, pos)
                .unwrap_or_else(|| panic!("inode {:?}: hole below length", self.sector));
            fs.cache.write(
                &fs.disk,
                sector,
                &buf[bytes_written..bytes_written + chunk],
                sector_ofs,
            );
            bytes_written += chunk;
        }
        state.unlock();
        Ok(bytes_written)
    }

    /// Disables writes to this inode.
    ///
    /// May be called at most once per opener; `deny_write_count` never
    /// exceeds the opener count.
    pub fn deny_write(&self) {
        let mut state = self.state.write();
        state.deny_write_count += 1;
        debug_assert!(state.deny_write_count <= state.open_count);
        state.unlock();
    }

    /// Re-enables writes; pairs with one earlier [`Inode::deny_write`] by
    /// the same opener.
    pub fn allow_write(&self) {
        let mut state = self.state.write();
        debug_assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
        state.unlock();
    }
}

/// Resolves the device sector containing byte `pos`, or `None` when no
/// sector is mapped there.
pub(super) fn byte_to_sector(fs: &FilesysInner, d: &DiskInode, pos: usize) -> Option<Sector> {
    let idx = pos / SECTOR_SIZE;
    if idx < DIRECT_PTRS {
        return d.direct[idx].get();
    }
    let idx = idx - DIRECT_PTRS;
    if idx < INDIRECT_PTRS {
        let indirect = d.indirect.get()?;
        return IndirectBlock::load(&fs.cache, &fs.disk, indirect).slots[idx].get();
    }
    let idx = idx - INDIRECT_PTRS;
    if idx < INDIRECT_PTRS * INDIRECT_PTRS {
        let doubly = d.doubly_indirect.get()?;
        let child =
            IndirectBlock::load(&fs.cache, &fs.disk, doubly).slots[idx / INDIRECT_PTRS].get()?;
        return IndirectBlock::load(&fs.cache, &fs.disk, child).slots[idx % INDIRECT_PTRS].get();
    }
    None
}

/// In-flight growth state: working copies of touched indirect sectors plus
/// the rollback list.
struct Growth<'a> {
    fs: &'a FilesysInner,
    blocks: BTreeMap<usize, IndirectBlock>,
    allocated: Vec<Sector>,
}

impl<'a> Growth<'a> {
    fn new(fs: &'a FilesysInner) -> Self {
        Self {
            fs,
            blocks: BTreeMap::new(),
            allocated: Vec::new(),
        }
    }

    /// Working copy of the indirect sector at `sector`, loading it on first
    /// touch.
    fn block(&mut self, sector: Sector) -> &mut IndirectBlock {
        self.blocks
            .entry(sector.into_usize())
            .or_insert_with(|| IndirectBlock::load(&self.fs.cache, &self.fs.disk, sector))
    }

    /// Allocates a brand-new indirect sector with every slot unused.
    fn fresh_block(&mut self) -> Result<Sector, KernelError> {
        let sector = self.fs.freemap.allocate()?;
        self.allocated.push(sector);
        self.blocks
            .insert(sector.into_usize(), IndirectBlock::new());
        Ok(sector)
    }

    /// Allocates and zero-fills one data sector.
    fn alloc_data(&mut self) -> Result<Sector, KernelError> {
        let sector = self.fs.freemap.allocate()?;
        self.allocated.push(sector);
        self.fs
            .cache
            .write(&self.fs.disk, sector, &[0u8; SECTOR_SIZE], 0);
        Ok(sector)
    }
}

/// Routes data sector `s` into pointer slot `idx` of the working copy,
/// allocating indirect sectors along the way.
fn set_pointer(
    work: &mut DiskInode,
    g: &mut Growth<'_>,
    idx: usize,
    s: Sector,
) -> Result<(), KernelError> {
    if idx < DIRECT_PTRS {
        work.direct[idx] = RawSector::from_sector(s);
        return Ok(());
    }
    let idx = idx - DIRECT_PTRS;
    if idx < INDIRECT_PTRS {
        let indirect = match work.indirect.get() {
            Some(sector) => sector,
            None => {
                let sector = g.fresh_block()?;
                work.indirect = RawSector::from_sector(sector);
                sector
            }
        };
        g.block(indirect).slots[idx] = RawSector::from_sector(s);
        return Ok(());
    }
    let idx = idx - INDIRECT_PTRS;
    let doubly = match work.doubly_indirect.get() {
        Some(sector) => sector,
        None => {
            let sector = g.fresh_block()?;
            work.doubly_indirect = RawSector::from_sector(sector);
            sector
        }
    };
    let (j, i) = (idx / INDIRECT_PTRS, idx % INDIRECT_PTRS);
    let child = match g.block(doubly).slots[j].get() {
        Some(sector) => sector,
        None => {
            let sector = g.fresh_block()?;
            g.block(doubly).slots[j] = RawSector::from_sector(sector);
            sector
        }
    };
    g.block(child).slots[i] = RawSector::from_sector(s);
    Ok(())
}

/// Grows the on-disk structure to cover `new_length` bytes.
///
/// On success every newly covered sector is allocated and zero-filled, the
/// touched indirect sectors and the inode sector are rewritten through the
/// buffer cache, and `d.length` is updated. On failure every sector this
/// call allocated is back in the free map and nothing was persisted.
pub(super) fn grow(
    fs: &FilesysInner,
    inode_sector: Sector,
    d: &mut DiskInode,
    new_length: usize,
) -> Result<(), KernelError> {
    let target = new_length.div_ceil(SECTOR_SIZE);
    let current = d.sectors();
    if target > MAX_FILE_SECTORS {
        return Err(KernelError::NoSpace);
    }
    debug_assert!(new_length >= d.length as usize);

    let mut work = d.clone();
    let mut g = Growth::new(fs);
    let mut failed = None;
    for idx in current..target {
        let result = match g.alloc_data() {
            Ok(s) => set_pointer(&mut work, &mut g, idx, s),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            failed = Some(e);
            break;
        }
    }

    if let Some(e) = failed {
        for sector in g.allocated {
            fs.freemap.release(sector);
        }
        debug!(
            "inode {:?}: growth to {} bytes failed, rolled back",
            inode_sector, new_length
        );
        return Err(e);
    }

    for (sector, block) in &g.blocks {
        block.store(&fs.cache, &fs.disk, Sector(*sector));
    }
    work.length = new_length as u32;
    *d = work;
    d.store(&fs.cache, &fs.disk, inode_sector);
    Ok(())
}

/// Releases every data and indirect sector of `d` back to the free map.
///
/// The inode sector itself is released by the caller.
pub(super) fn release_blocks(fs: &FilesysInner, d: &DiskInode) {
    for ptr in &d.direct {
        if let Some(sector) = ptr.get() {
            fs.freemap.release(sector);
        }
    }
    if let Some(indirect) = d.indirect.get() {
        let block = IndirectBlock::load(&fs.cache, &fs.disk, indirect);
        for ptr in &block.slots {
            if let Some(sector) = ptr.get() {
                fs.freemap.release(sector);
            }
        }
        fs.freemap.release(indirect);
    }
    if let Some(doubly) = d.doubly_indirect.get() {
        let block = IndirectBlock::load(&fs.cache, &fs.disk, doubly);
        for ptr in &block.slots {
            if let Some(child) = ptr.get() {
                let inner = IndirectBlock::load(&fs.cache, &fs.disk, child);
                for p in &inner.slots {
                    if let Some(sector) = p.get() {
                        fs.freemap.release(sector);
                    }
                }
                fs.freemap.release(child);
            }
        }
        fs.freemap.release(doubly);
    }
}
