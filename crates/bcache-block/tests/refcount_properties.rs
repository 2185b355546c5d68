#![forbid(unsafe_code)]

use bcache_block::{
    BlockDevice, BufferCache, ByteBlockDevice, DeviceTable, ManualTicks, MemByteDevice, SlotHandle,
    SlotPin,
};
use bcache_error::BcacheError;
use bcache_types::{BlockNumber, BlockSize, CacheConfig, DeviceId, SlotId};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 512;
const DEV: DeviceId = DeviceId(3);
const BLOCKS: u64 = 24;

#[derive(Debug, Clone)]
enum Op {
    Acquire(u64),
    Release(usize),
    Pin(usize),
    Unpin(usize),
    Tick,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..BLOCKS).prop_map(Op::Acquire),
        3 => any::<usize>().prop_map(Op::Release),
        2 => any::<usize>().prop_map(Op::Pin),
        2 => any::<usize>().prop_map(Op::Unpin),
        1 => Just(Op::Tick),
    ]
}

fn build(slot_count: u32, shard_count: u32, ticks: Arc<ManualTicks>) -> BufferCache<DeviceTable> {
    let bs = BlockSize::new(BLOCK_SIZE).unwrap();
    let table = DeviceTable::new(bs);
    let device: Arc<dyn BlockDevice> = Arc::new(
        ByteBlockDevice::new(MemByteDevice::new(BLOCKS as usize * bs.bytes()), bs).unwrap(),
    );
    table.attach(DEV, device).unwrap();
    let geometry = CacheConfig {
        slot_count,
        shard_count,
        block_size: BLOCK_SIZE,
    }
    .validate()
    .unwrap();
    BufferCache::with_ticks(geometry, table, ticks).unwrap()
}

/// Check every slot's refcount against the references the test holds.
fn check_model(
    cache: &BufferCache<DeviceTable>,
    handles: &[SlotHandle<'_, DeviceTable>],
    pins: &[SlotPin],
) -> Result<(), TestCaseError> {
    let slot_count = cache.geometry().slot_count();
    let mut expected: HashMap<SlotId, u32> = HashMap::new();
    for slot in handles
        .iter()
        .map(SlotHandle::slot)
        .chain(pins.iter().map(SlotPin::slot))
    {
        *expected.entry(slot).or_default() += 1;
    }

    prop_assert_eq!(
        cache.shard_occupancy().iter().sum::<usize>(),
        slot_count as usize
    );
    for raw in 0..slot_count {
        let slot = SlotId(raw);
        let state = cache.slot_state(slot).unwrap();
        prop_assert_eq!(state.refcount, expected.get(&slot).copied().unwrap_or(0));
        if state.refcount > 0 {
            let key = state.key.unwrap();
            prop_assert_eq!(state.shard, cache.geometry().shard_of(key.block));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn refcounts_track_outstanding_references(
        slot_count in 1_u32..8,
        shard_pick in 0_u32..8,
        ops in proptest::collection::vec(op_strategy(), 1..120),
    ) {
        let shard_count = shard_pick % slot_count + 1;
        let ticks = Arc::new(ManualTicks::new(1));
        let cache = build(slot_count, shard_count, Arc::clone(&ticks));
        let mut handles: Vec<SlotHandle<'_, DeviceTable>> = Vec::new();
        let mut pins: Vec<SlotPin> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(block) => {
                    // Holding the data lock twice on one thread would deadlock.
                    if handles.iter().any(|h| h.block() == BlockNumber(block)) {
                        continue;
                    }
                    match cache.acquire(DEV, BlockNumber(block)) {
                        Ok(handle) => {
                            prop_assert_eq!(handle.block(), BlockNumber(block));
                            handles.push(handle);
                        }
                        Err(BcacheError::CacheExhausted { .. }) => {
                            // Only legal when every slot is referenced.
                            for raw in 0..slot_count {
                                prop_assert!(cache.slot_state(SlotId(raw)).unwrap().refcount > 0);
                            }
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {other}"),
                    }
                }
                Op::Release(idx) if !handles.is_empty() => {
                    let handle = handles.swap_remove(idx % handles.len());
                    cache.release(handle).unwrap();
                }
                Op::Pin(idx) if !handles.is_empty() => {
                    let pin = cache.pin(&handles[idx % handles.len()]).unwrap();
                    pins.push(pin);
                }
                Op::Unpin(idx) if !pins.is_empty() => {
                    let pin = pins.swap_remove(idx % pins.len());
                    cache.unpin(pin).unwrap();
                }
                Op::Tick => {
                    ticks.advance(1);
                }
                Op::Release(_) | Op::Pin(_) | Op::Unpin(_) => {}
            }
            check_model(&cache, &handles, &pins)?;
        }

        for handle in handles.drain(..) {
            cache.release(handle).unwrap();
        }
        for pin in pins.drain(..) {
            cache.unpin(pin).unwrap();
        }
        check_model(&cache, &handles, &pins)?;
    }

    #[test]
    fn lru_reuse_never_touches_referenced_slots(
        held in proptest::collection::btree_set(0_u64..BLOCKS, 1..4),
        churn in proptest::collection::vec(0_u64..BLOCKS, 1..40),
    ) {
        let ticks = Arc::new(ManualTicks::new(1));
        let cache = build(6, 1, Arc::clone(&ticks));
        let pins: Vec<SlotPin> = held
            .iter()
            .map(|&block| {
                let handle = cache.acquire(DEV, BlockNumber(block)).unwrap();
                let pin = cache.pin(&handle).unwrap();
                cache.release(handle).unwrap();
                pin
            })
            .collect();

        for block in churn {
            ticks.advance(1);
            let handle = cache.acquire(DEV, BlockNumber(block)).unwrap();
            cache.release(handle).unwrap();
            for pin in &pins {
                let state = cache.slot_state(pin.slot()).unwrap();
                prop_assert_eq!(state.key, Some(pin.key()));
                prop_assert!(state.refcount >= 1);
            }
        }

        for pin in pins {
            cache.unpin(pin).unwrap();
        }
    }
}
