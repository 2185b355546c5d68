//! Cache manager: the acquire/read/write/release/pin/unpin surface.
//!
//! # Acquire
//!
//! 1. Lock the block's home shard. A cached identity is a hit: take a
//!    reference, unlock, wait for the data lock.
//! 2. Otherwise reuse the home shard's least recently idled unreferenced
//!    slot in place.
//! 3. Otherwise unlock the home shard, take the steal permit, and visit the
//!    other shards in ascending order, locking home and donor as an ordered
//!    pair. Home is re-checked on every visit because it was unlocked while
//!    waiting. The first unreferenced donor slot moves to home and is
//!    claimed. If no donor has one the acquire fails with
//!    [`BcacheError::CacheExhausted`].
//!
//! A handle with a reference keeps its slot in the block's home shard: only
//! unreferenced slots are ever stolen or re-claimed. Release and pin rely on
//! this to find the slot without the steal permit.

use crate::metrics::{CacheMetrics, CacheMetricsSnapshot};
use crate::shard::{self, Shard};
use crate::slot::{BlockKey, SlotData};
use crate::table::ShardTable;
use crate::tick::{MonotonicTicks, TickSource};
use crate::transport::BlockTransport;
use bcache_error::{BcacheError, Result};
use bcache_types::{BlockNumber, CacheConfig, CacheGeometry, DeviceId, SlotId};
use parking_lot::MutexGuard;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How the home shard satisfied an acquire.
#[derive(Debug, Clone, Copy)]
enum HomeOutcome {
    Hit { slot: SlotId, epoch: u64 },
    Reused { slot: SlotId, epoch: u64 },
}

fn try_home(shard: &mut Shard, key: BlockKey) -> Option<HomeOutcome> {
    if let Some((slot, epoch)) = shard.reference_cached(key) {
        return Some(HomeOutcome::Hit { slot, epoch });
    }
    shard
        .claim_lru(key)
        .map(|(slot, epoch)| HomeOutcome::Reused { slot, epoch })
}

/// Diagnostic view of one slot's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotState {
    /// Shard currently holding the slot.
    pub shard: usize,
    /// Cached identity, if any.
    pub key: Option<BlockKey>,
    pub refcount: u32,
    pub last_idle_tick: u64,
}

/// Sharded buffer cache over a [`BlockTransport`].
pub struct BufferCache<T: BlockTransport> {
    table: ShardTable,
    transport: T,
    ticks: Arc<dyn TickSource>,
    metrics: CacheMetrics,
}

impl<T: BlockTransport> BufferCache<T> {
    /// Build a cache that stamps idle times with [`MonotonicTicks`].
    pub fn new(geometry: CacheGeometry, transport: T) -> Result<Self> {
        Self::with_ticks(geometry, transport, Arc::new(MonotonicTicks::new()))
    }

    /// Validate `config` and build a cache from it.
    pub fn from_config(config: &CacheConfig, transport: T) -> Result<Self> {
        let geometry = config.validate().map_err(crate::geometry_error)?;
        Self::new(geometry, transport)
    }

    pub fn with_ticks(
        geometry: CacheGeometry,
        transport: T,
        ticks: Arc<dyn TickSource>,
    ) -> Result<Self> {
        if transport.block_size() != geometry.block_size() {
            return Err(BcacheError::InvalidGeometry(format!(
                "transport block size {} does not match cache block size {}",
                transport.block_size(),
                geometry.block_size()
            )));
        }
        Ok(Self {
            table: ShardTable::new(geometry),
            transport,
            ticks,
            metrics: CacheMetrics::new(),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &CacheGeometry {
        self.table.geometry()
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Return an exclusively locked handle on the slot caching
    /// `(device, block)`, claiming a slot if the block is not cached.
    ///
    /// Blocks while another handle holds the slot's data lock. Acquiring a
    /// block the calling thread already holds deadlocks.
    pub fn acquire(&self, device: DeviceId, block: BlockNumber) -> Result<SlotHandle<'_, T>> {
        let key = BlockKey::new(device, block);
        let home = self.table.shard_index(block);

        let mut shard = self.table.lock_shard(home);
        let outcome = try_home(&mut shard, key);
        drop(shard);

        match outcome {
            Some(outcome) => Ok(self.finish_home(key, outcome)),
            None => self.acquire_by_stealing(key, home),
        }
    }

    fn acquire_by_stealing(&self, key: BlockKey, home: usize) -> Result<SlotHandle<'_, T>> {
        let permit = self.table.begin_steal();

        let mut recipient = self.table.lock_shard(home);
        if let Some(outcome) = try_home(&mut recipient, key) {
            drop(recipient);
            drop(permit);
            return Ok(self.finish_home(key, outcome));
        }
        drop(recipient);

        for donor_idx in (0..self.table.shard_count()).filter(|&idx| idx != home) {
            let (mut recipient, mut donor) = self.table.lock_pair(&permit, home, donor_idx);
            if let Some(outcome) = try_home(&mut recipient, key) {
                drop(donor);
                drop(recipient);
                drop(permit);
                return Ok(self.finish_home(key, outcome));
            }
            let Some((slot, epoch)) = shard::steal(&permit, &mut donor, &mut recipient, key)
            else {
                continue;
            };
            drop(donor);
            drop(recipient);
            drop(permit);

            self.metrics.record_steal();
            debug!(
                device = %key.device,
                block = key.block.0,
                slot = slot.0,
                donor = donor_idx,
                recipient = home,
                "bcache_steal"
            );
            return Ok(self.lock_slot(key, slot, epoch));
        }
        drop(permit);

        self.metrics.record_exhausted();
        warn!(
            device = %key.device,
            block = key.block.0,
            slot_count = self.table.geometry().slot_count(),
            "bcache_exhausted"
        );
        Err(BcacheError::CacheExhausted {
            device: key.device.0,
            block: key.block.0,
        })
    }

    fn finish_home(&self, key: BlockKey, outcome: HomeOutcome) -> SlotHandle<'_, T> {
        match outcome {
            HomeOutcome::Hit { slot, epoch } => {
                self.metrics.record_hit();
                trace!(device = %key.device, block = key.block.0, slot = slot.0, "bcache_hit");
                self.lock_slot(key, slot, epoch)
            }
            HomeOutcome::Reused { slot, epoch } => {
                self.metrics.record_local_eviction();
                trace!(
                    device = %key.device,
                    block = key.block.0,
                    slot = slot.0,
                    "bcache_local_evict"
                );
                self.lock_slot(key, slot, epoch)
            }
        }
    }

    /// Wait for the slot's data lock. Called with no shard lock held.
    fn lock_slot(&self, key: BlockKey, slot: SlotId, epoch: u64) -> SlotHandle<'_, T> {
        let mut data = self.table.data_lock(slot).lock();
        data.adopt(epoch);
        SlotHandle {
            cache: self,
            key,
            slot,
            data: Some(data),
            released: false,
        }
    }

    fn check_owner(&self, handle: &SlotHandle<'_, T>) -> Result<()> {
        if std::ptr::eq(handle.cache, self) {
            Ok(())
        } else {
            Err(BcacheError::ContractViolation(
                "handle belongs to a different cache",
            ))
        }
    }

    /// Return the block's contents, reading them from the device if the slot
    /// does not hold a valid copy.
    ///
    /// A failed device read leaves the slot invalid, so the next `read`
    /// retries the device.
    pub fn read<'h>(&self, handle: &'h mut SlotHandle<'_, T>) -> Result<&'h [u8]> {
        self.check_owner(handle)?;
        let key = handle.key;
        let Some(data) = handle.data.as_mut() else {
            warn!(device = %key.device, block = key.block.0, "bcache_read_unlocked");
            return Err(BcacheError::ContractViolation(
                "read without holding the slot data lock",
            ));
        };
        if !data.is_valid() {
            self.metrics.record_device_read();
            if let Err(err) = self
                .transport
                .sync_read(key.device, key.block, data.payload_mut())
            {
                debug!(
                    device = %key.device,
                    block = key.block.0,
                    error = %err,
                    "bcache_read_failed"
                );
                return Err(err);
            }
            data.set_valid(true);
        }
        Ok(data.payload())
    }

    /// Write the slot's payload to the device. Does not change validity.
    pub fn write(&self, handle: &SlotHandle<'_, T>) -> Result<()> {
        self.check_owner(handle)?;
        let key = handle.key;
        let Some(data) = handle.data.as_ref() else {
            warn!(device = %key.device, block = key.block.0, "bcache_write_unlocked");
            return Err(BcacheError::ContractViolation(
                "write without holding the slot data lock",
            ));
        };
        self.metrics.record_device_write();
        self.transport
            .sync_write(key.device, key.block, data.payload())
    }

    /// Give up the data lock and the handle's reference.
    ///
    /// Fails with `ContractViolation` if the handle had already given up its
    /// data lock; the reference is then returned when the handle drops.
    pub fn release(&self, mut handle: SlotHandle<'_, T>) -> Result<()> {
        self.check_owner(&handle)?;
        if handle.data.is_none() {
            warn!(
                device = %handle.key.device,
                block = handle.key.block.0,
                "bcache_release_unlocked"
            );
            return Err(BcacheError::ContractViolation(
                "release without holding the slot data lock",
            ));
        }
        handle.data = None;
        handle.released = true;
        self.release_ref(handle.key, handle.slot)
    }

    /// Take an extra reference that keeps the slot resident without holding
    /// its data lock.
    pub fn pin(&self, handle: &SlotHandle<'_, T>) -> Result<SlotPin> {
        self.check_owner(handle)?;
        let mut shard = self.table.lock_shard(self.table.shard_index(handle.key.block));
        let meta = shard
            .slot_mut(handle.slot)
            .ok_or(BcacheError::ContractViolation(
                "referenced slot missing from its home shard",
            ))?;
        meta.refcount += 1;
        Ok(SlotPin {
            key: handle.key,
            slot: handle.slot,
        })
    }

    /// Drop a reference taken by [`pin`](Self::pin).
    ///
    /// Unlike `release`, reaching zero here does not refresh the slot's idle
    /// tick, so a slot whose last reference was a pin keeps the recency of
    /// its last `release`.
    #[expect(clippy::needless_pass_by_value)] // the pin is spent
    pub fn unpin(&self, pin: SlotPin) -> Result<()> {
        let mut shard = self.table.lock_shard(self.table.shard_index(pin.key.block));
        let meta = shard
            .slot_mut(pin.slot)
            .ok_or(BcacheError::ContractViolation(
                "pinned slot missing from its home shard",
            ))?;
        if meta.refcount == 0 || meta.key != Some(pin.key) {
            warn!(
                device = %pin.key.device,
                block = pin.key.block.0,
                slot = pin.slot.0,
                "bcache_unpin_unreferenced"
            );
            return Err(BcacheError::ContractViolation(
                "unpin of a slot with no outstanding reference",
            ));
        }
        meta.refcount -= 1;
        Ok(())
    }

    /// Acquire `(device, block)` and make sure its contents are loaded.
    pub fn bread(&self, device: DeviceId, block: BlockNumber) -> Result<SlotHandle<'_, T>> {
        let mut handle = self.acquire(device, block)?;
        self.read(&mut handle)?;
        Ok(handle)
    }

    /// Forget every unreferenced slot caching a block of `device`.
    ///
    /// Referenced slots are left alone. Returns the number of slots dropped.
    pub fn invalidate_device(&self, device: DeviceId) -> usize {
        let dropped = (0..self.table.shard_count())
            .map(|idx| {
                self.table
                    .lock_shard(idx)
                    .forget_idle_where(|key| key.device == device)
            })
            .sum();
        debug!(device = %device, dropped, "bcache_invalidate_device");
        dropped
    }

    /// Member count of each shard, as one consistent snapshot.
    #[must_use]
    pub fn shard_occupancy(&self) -> Vec<usize> {
        self.table.occupancy()
    }

    /// Current metadata of `slot`, or `None` if the id is out of range.
    #[must_use]
    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        self.table.locate(slot).map(|located| SlotState {
            shard: located.shard,
            key: located.meta.key,
            refcount: located.meta.refcount,
            last_idle_tick: located.meta.last_idle_tick,
        })
    }

    /// Drop one reference; stamp the idle tick when it was the last.
    fn release_ref(&self, key: BlockKey, slot: SlotId) -> Result<()> {
        let mut shard = self.table.lock_shard(self.table.shard_index(key.block));
        let meta = shard
            .slot_mut(slot)
            .ok_or(BcacheError::ContractViolation(
                "referenced slot missing from its home shard",
            ))?;
        if meta.refcount == 0 {
            return Err(BcacheError::ContractViolation(
                "release of a slot with no outstanding reference",
            ));
        }
        meta.refcount -= 1;
        if meta.refcount == 0 {
            meta.last_idle_tick = self.ticks.now();
        }
        Ok(())
    }
}

impl<T: BlockTransport> std::fmt::Debug for BufferCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("geometry", self.table.geometry())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

/// A referenced slot, normally holding the slot's data lock.
///
/// Dropping a handle that was not passed to [`BufferCache::release`]
/// returns its reference the same way `release` does.
pub struct SlotHandle<'a, T: BlockTransport> {
    cache: &'a BufferCache<T>,
    key: BlockKey,
    slot: SlotId,
    data: Option<MutexGuard<'a, SlotData>>,
    released: bool,
}

impl<T: BlockTransport> SlotHandle<'_, T> {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.key.block
    }

    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Whether this handle currently holds the slot's data lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.data.is_some()
    }

    /// Whether the payload holds the device contents. `None` when unlocked.
    #[must_use]
    pub fn is_valid(&self) -> Option<bool> {
        self.data.as_ref().map(|data| data.is_valid())
    }

    pub fn data(&self) -> Result<&[u8]> {
        self.data
            .as_ref()
            .map(|data| data.payload())
            .ok_or(BcacheError::ContractViolation(
                "payload access without holding the slot data lock",
            ))
    }

    /// Mutable payload. Changes reach the device only through
    /// [`BufferCache::write`].
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        self.data
            .as_mut()
            .map(|data| data.payload_mut())
            .ok_or(BcacheError::ContractViolation(
                "payload access without holding the slot data lock",
            ))
    }

    /// Give up the data lock but keep the reference, so the slot stays
    /// resident. No-op if already unlocked.
    pub fn unlock(&mut self) {
        self.data = None;
    }

    /// Re-take the data lock after [`unlock`](Self::unlock). Blocks while
    /// another handle holds it.
    pub fn relock(&mut self) {
        if self.data.is_none() {
            self.data = Some(self.cache.table.data_lock(self.slot).lock());
        }
    }
}

impl<T: BlockTransport> Drop for SlotHandle<'_, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.data = None;
        if let Err(err) = self.cache.release_ref(self.key, self.slot) {
            warn!(
                device = %self.key.device,
                block = self.key.block.0,
                slot = self.slot.0,
                error = %err,
                "bcache_drop_release_failed"
            );
        }
    }
}

impl<T: BlockTransport> std::fmt::Debug for SlotHandle<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("locked", &self.data.is_some())
            .finish_non_exhaustive()
    }
}

/// Reference taken by [`BufferCache::pin`]; hand it back to
/// [`BufferCache::unpin`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pin keeps its slot resident until passed to unpin"]
pub struct SlotPin {
    key: BlockKey,
    slot: SlotId,
}

impl SlotPin {
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}
