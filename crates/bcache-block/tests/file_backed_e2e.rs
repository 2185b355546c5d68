#![forbid(unsafe_code)]

use bcache_block::{BlockDevice, BufferCache, ByteBlockDevice, DeviceTable, FileByteDevice};
use bcache_error::BcacheError;
use bcache_types::{BlockNumber, BlockSize, CacheConfig, DeviceId};
use std::io::Write;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 1024;
const BLOCKS: usize = 32;

fn image_with_pattern() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let image: Vec<u8> = (0..BLOCKS)
        .flat_map(|block| std::iter::repeat_n(u8::try_from(block).unwrap(), BLOCK_SIZE as usize))
        .collect();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    file
}

fn attach(table: &DeviceTable, id: DeviceId, path: &std::path::Path) {
    let bs = BlockSize::new(BLOCK_SIZE).unwrap();
    let device: Arc<dyn BlockDevice> =
        Arc::new(ByteBlockDevice::new(FileByteDevice::open(path).unwrap(), bs).unwrap());
    table.attach(id, device).unwrap();
}

#[test]
fn default_geometry_reads_and_writes_through_file() {
    let image = image_with_pattern();
    let table = DeviceTable::new(BlockSize::new(BLOCK_SIZE).unwrap());
    attach(&table, DeviceId(1), image.path());
    let cache = BufferCache::from_config(&CacheConfig::default(), table).unwrap();
    assert_eq!(cache.geometry().slot_count(), 30);
    assert_eq!(cache.geometry().shard_count(), 13);

    for block in 0..BLOCKS as u64 {
        let handle = cache.bread(DeviceId(1), BlockNumber(block)).unwrap();
        assert!(
            handle
                .data()
                .unwrap()
                .iter()
                .all(|&b| u64::from(b) == block)
        );
        cache.release(handle).unwrap();
    }
    // 32 distinct blocks through 30 slots: some had to be recycled.
    let metrics = cache.metrics();
    assert_eq!(metrics.misses, BLOCKS as u64);
    assert_eq!(metrics.exhausted, 0);

    let mut handle = cache.bread(DeviceId(1), BlockNumber(5)).unwrap();
    handle.data_mut().unwrap().fill(0xEE);
    cache.write(&handle).unwrap();
    cache.release(handle).unwrap();
    cache.transport().sync_all().unwrap();

    let raw = std::fs::read(image.path()).unwrap();
    let start = 5 * BLOCK_SIZE as usize;
    assert!(raw[start..start + BLOCK_SIZE as usize].iter().all(|&b| b == 0xEE));
    assert_eq!(raw[start - 1], 4);
}

#[test]
fn blocks_of_two_devices_never_alias() {
    let first = image_with_pattern();
    let second = image_with_pattern();
    let table = DeviceTable::new(BlockSize::new(BLOCK_SIZE).unwrap());
    attach(&table, DeviceId(1), first.path());
    attach(&table, DeviceId(2), second.path());
    let config = CacheConfig {
        slot_count: 4,
        shard_count: 2,
        block_size: BLOCK_SIZE,
    };
    let cache = BufferCache::from_config(&config, table).unwrap();

    let mut handle = cache.bread(DeviceId(2), BlockNumber(3)).unwrap();
    handle.data_mut().unwrap().fill(0x77);
    cache.write(&handle).unwrap();
    cache.release(handle).unwrap();

    let one = cache.bread(DeviceId(1), BlockNumber(3)).unwrap();
    assert!(one.data().unwrap().iter().all(|&b| b == 3));
    let two = cache.bread(DeviceId(2), BlockNumber(3)).unwrap();
    assert!(two.data().unwrap().iter().all(|&b| b == 0x77));
    assert_ne!(one.slot(), two.slot());
    cache.release(one).unwrap();
    cache.release(two).unwrap();
}

#[test]
fn detached_device_fails_reads_until_reattached() {
    let image = image_with_pattern();
    let table = DeviceTable::new(BlockSize::new(BLOCK_SIZE).unwrap());
    attach(&table, DeviceId(9), image.path());
    let config = CacheConfig {
        slot_count: 2,
        shard_count: 1,
        block_size: BLOCK_SIZE,
    };
    let cache = BufferCache::from_config(&config, table).unwrap();

    let handle = cache.bread(DeviceId(9), BlockNumber(1)).unwrap();
    cache.release(handle).unwrap();

    assert!(cache.transport().detach(DeviceId(9)));
    assert_eq!(cache.invalidate_device(DeviceId(9)), 1);

    let err = cache.bread(DeviceId(9), BlockNumber(1)).unwrap_err();
    assert!(matches!(err, BcacheError::UnknownDevice(9)));
    assert_eq!(err.to_errno(), libc::ENODEV);

    attach(cache.transport(), DeviceId(9), image.path());
    let handle = cache.bread(DeviceId(9), BlockNumber(1)).unwrap();
    assert!(handle.data().unwrap().iter().all(|&b| b == 1));
    cache.release(handle).unwrap();
}

#[test]
fn out_of_range_block_leaves_slot_invalid() {
    let image = image_with_pattern();
    let table = DeviceTable::new(BlockSize::new(BLOCK_SIZE).unwrap());
    attach(&table, DeviceId(1), image.path());
    let config = CacheConfig {
        slot_count: 2,
        shard_count: 2,
        block_size: BLOCK_SIZE,
    };
    let cache = BufferCache::from_config(&config, table).unwrap();

    let mut handle = cache.acquire(DeviceId(1), BlockNumber(BLOCKS as u64)).unwrap();
    assert!(matches!(cache.read(&mut handle), Err(BcacheError::Format(_))));
    assert_eq!(handle.is_valid(), Some(false));
    cache.release(handle).unwrap();
}
