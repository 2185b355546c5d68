//! Slot state, split by the lock that guards it.
//!
//! A slot has two independent halves:
//!
//! - [`SlotMeta`]: identity, reference count, idle timestamp and claim
//!   epoch. Lives inside the owning shard and is only touched under that
//!   shard's lock. It moves between shards when the slot is stolen.
//! - [`SlotData`]: validity flag and payload. Lives in the table's fixed
//!   slot array behind the slot's [`DataLock`] and never moves.
//!
//! The two halves are linked by the claim epoch: every time a slot is
//! claimed for a new identity its epoch advances, and the first data-lock
//! holder that sees a stale epoch in `SlotData` discards the old payload.

use bcache_types::{BlockNumber, DeviceId, SlotId};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

/// Identity of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockKey {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockKey {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

/// Shard-guarded half of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotMeta {
    pub(crate) id: SlotId,
    pub(crate) key: Option<BlockKey>,
    pub(crate) refcount: u32,
    pub(crate) last_idle_tick: u64,
    pub(crate) epoch: u64,
}

impl SlotMeta {
    pub(crate) fn new(id: SlotId) -> Self {
        Self {
            id,
            key: None,
            refcount: 0,
            last_idle_tick: 0,
            epoch: 0,
        }
    }

    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.refcount == 0
    }

    /// Take the slot over for `key` with a single reference.
    ///
    /// Caller must have checked `is_idle()`.
    pub(crate) fn claim(&mut self, key: BlockKey) -> u64 {
        debug_assert!(self.is_idle(), "claiming referenced slot {}", self.id);
        self.key = Some(key);
        self.refcount = 1;
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }
}

/// Data-lock-guarded half of a slot.
#[derive(Debug)]
pub struct SlotData {
    epoch: u64,
    valid: bool,
    payload: Box<[u8]>,
}

impl SlotData {
    fn new(block_size: usize) -> Self {
        Self {
            epoch: 0,
            valid: false,
            payload: vec![0_u8; block_size].into_boxed_slice(),
        }
    }

    /// Whether the payload mirrors the device contents for the current
    /// identity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Bring the data half in line with the claim epoch the holder was
    /// granted. A mismatch means the slot was re-claimed since the payload
    /// was last filled, so it no longer describes this identity.
    pub(crate) fn adopt(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.epoch = epoch;
            self.valid = false;
        }
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }
}

/// Long-hold exclusive lock over a slot's payload.
///
/// Distinct from the shard lock: it may be held across device I/O and
/// across the caller's whole critical section.
#[derive(Debug)]
pub(crate) struct DataLock {
    inner: Mutex<SlotData>,
}

impl DataLock {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            inner: Mutex::new(SlotData::new(block_size)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotData> {
        self.inner.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}
