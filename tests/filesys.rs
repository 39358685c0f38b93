//! End-to-end storage scenarios: inode layer over the buffer cache over a
//! RAM block device.

use std::sync::Arc;
use teos::bcache::BufferCache;
use teos::block::{Disk, MemDisk, SECTOR_SIZE, Sector};
use teos::fs::Filesys;
use teos::thread::Runtime;

struct StdRuntime;

impl Runtime for StdRuntime {
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
    let cache = BufferCache::new(Arc::new(StdRuntime));
    let disk = Disk::new(0, Arc::new(MemDisk::new(sectors)));
    Filesys::format(disk, cache)
}

#[test]
fn large_file_persists_across_reopen() {
    // An 8 MB device comfortably holds a 400 kB file.
    let fs = fresh_fs(16 * 1024);
    fs.freemap().allocate_at(Sector(10)).unwrap();
    fs.create(Sector(10), 400_000)
        .expect("creating a 400 kB file on a fresh 8 MB device must succeed");

    let inode = fs.open(Sector(10)).unwrap();
    assert_eq!(inode.length(), 400_000);

    let mut byte = [0xFFu8];
    inode.read_at(&mut byte, 0).unwrap();
    assert_eq!(byte[0], 0, "fresh file content reads as zeroes");
    inode.read_at(&mut byte, 399_999).unwrap();
    assert_eq!(byte[0], 0, "fresh file content reads as zeroes");

    assert_eq!(inode.write_at(&[0xAB], 399_999).unwrap(), 1);
    fs.close(&inode);

    let inode = fs.open(Sector(10)).unwrap();
    let mut byte = [0u8];
    inode.read_at(&mut byte, 399_999).unwrap();
    assert_eq!(byte[0], 0xAB, "data must survive close and reopen");
    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn growth_to_maximum_file_size() {
    use teos::fs::disk_layout::MAX_FILE_SECTORS;
    // Device large enough for the biggest addressable file plus metadata:
    // 16_636 data sectors, 130 indirect sectors, the free map, the inode.
    let fs = fresh_fs(17_000);
    let sector = fs.freemap().allocate().unwrap();
    fs.create(sector, MAX_FILE_SECTORS * SECTOR_SIZE)
        .expect("growth to the maximum file size must succeed");

    let inode = fs.open(sector).unwrap();
    assert_eq!(inode.length(), MAX_FILE_SECTORS * SECTOR_SIZE);
    // One byte more fails cleanly.
    assert_eq!(
        inode.write_at(&[1], MAX_FILE_SECTORS * SECTOR_SIZE).unwrap(),
        0,
        "one byte past the maximum must be rejected"
    );
    // The last addressable byte works.
    assert_eq!(
        inode
            .write_at(&[0x77], MAX_FILE_SECTORS * SECTOR_SIZE - 1)
            .unwrap(),
        1
    );
    let mut byte = [0u8];
    inode
        .read_at(&mut byte, MAX_FILE_SECTORS * SECTOR_SIZE - 1)
        .unwrap();
    assert_eq!(byte[0], 0x77);
    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn out_of_disk_mid_write_keeps_prefix() {
    // A small device fills up partway through a 1 MB write.
    let fs = fresh_fs(700);
    let sector = fs.freemap().allocate().unwrap();
    fs.create(sector, 0).unwrap();
    let inode = fs.open(sector).unwrap();

    let data = vec![0x3Cu8; 1024 * 1024];
    let written = inode.write_at(&data, 0).unwrap();
    assert!(
        written > 0 && written < data.len(),
        "the write must stop partway, not fail outright"
    );
    assert_eq!(
        inode.length(),
        written,
        "length reflects only the accepted prefix"
    );

    let mut out = vec![0u8; written];
    assert_eq!(inode.read_at(&mut out, 0).unwrap(), written);
    assert!(out.iter().all(|&b| b == 0x3C));
    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn write_behind_reaches_raw_device_without_flush() {
    let dev = Arc::new(MemDisk::new(1024));
    let cache = BufferCache::new(Arc::new(StdRuntime));
    let disk = Disk::new(0, dev.clone());
    let fs = Filesys::format(disk.clone(), cache);

    // The first data sector a fresh file allocates is the first free
    // sector after the persisted free map.
    let data_start = fs.freemap().allocated_count();
    let inode_sector = Sector(500);
    fs.freemap().allocate_at(inode_sector).unwrap();
    fs.create(inode_sector, SECTOR_SIZE).unwrap();
    let inode = fs.open(inode_sector).unwrap();
    inode.write_at(&[0xEE; 16], 0).unwrap();

    // One write-behind period is 1000 ticks = 20 ms of test time; poll the
    // raw device until the worker lands.
    let mut raw = [0u8; SECTOR_SIZE];
    for _ in 0..500 {
        disk.read(Sector(data_start), &mut raw).unwrap();
        if raw[0] == 0xEE {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(
        &raw[..16],
        &[0xEE; 16],
        "the write-behind worker must push dirty sectors to the device"
    );
    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn round_trip_survives_cache_turnover() {
    // More distinct sectors than the cache holds, so every entry turns
    // over several times between the write and the read-back.
    let fs = fresh_fs(2048);
    let sector = fs.freemap().allocate().unwrap();
    fs.create(sector, 0).unwrap();
    let inode = fs.open(sector).unwrap();

    let data: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 7) as u8).collect();
    assert_eq!(inode.write_at(&data, 0).unwrap(), data.len());

    let mut out = vec![0u8; data.len()];
    assert_eq!(inode.read_at(&mut out, 0).unwrap(), data.len());
    assert_eq!(out, data, "bytes must round-trip through cache turnover");

    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn two_files_interleaved_writers() {
    let fs = fresh_fs(4096);
    let sector_a = fs.freemap().allocate().unwrap();
    let sector_b = fs.freemap().allocate().unwrap();
    fs.create(sector_a, 0).unwrap();
    fs.create(sector_b, 0).unwrap();

    let fs_a = fs.clone();
    let fs_b = fs.clone();
    let writer_a = std::thread::spawn(move || {
        let inode = fs_a.open(sector_a).unwrap();
        for i in 0..64usize {
            let block = [0xA0u8 | (i as u8 & 0x0F); 1024];
            assert_eq!(inode.write_at(&block, i * 1024).unwrap(), 1024);
        }
        fs_a.close(&inode);
    });
    let writer_b = std::thread::spawn(move || {
        let inode = fs_b.open(sector_b).unwrap();
        for i in 0..64usize {
            let block = [0x50u8 | (i as u8 & 0x0F); 1024];
            assert_eq!(inode.write_at(&block, i * 1024).unwrap(), 1024);
        }
        fs_b.close(&inode);
    });
    writer_a.join().unwrap();
    writer_b.join().unwrap();

    let inode = fs.open(sector_a).unwrap();
    let mut buf = [0u8; 1024];
    inode.read_at(&mut buf, 63 * 1024).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAF));
    fs.close(&inode);

    let inode = fs.open(sector_b).unwrap();
    inode.read_at(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0x50));
    fs.close(&inode);
    fs.shutdown();
}

#[test]
fn freemap_survives_remount() {
    let dev = Arc::new(MemDisk::new(2048));
    let cache = BufferCache::new(Arc::new(StdRuntime));
    let fs = Filesys::format(Disk::new(0, dev.clone()), cache);
    let sector = fs.freemap().allocate().unwrap();
    fs.create(sector, 10 * SECTOR_SIZE).unwrap();
    let allocated = fs.freemap().allocated_count();
    fs.shutdown();

    let cache = BufferCache::new(Arc::new(StdRuntime));
    let fs = Filesys::mount(Disk::new(0, dev), cache);
    assert_eq!(
        fs.freemap().allocated_count(),
        allocated,
        "the free map must persist across shutdown and remount"
    );
    let inode = fs.open(sector).unwrap();
    assert_eq!(inode.length(), 10 * SECTOR_SIZE);
    fs.close(&inode);
    fs.shutdown();
}
