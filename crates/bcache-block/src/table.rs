//! Fixed array of shards plus the steal coordination lock.
//!
//! # Lock order
//!
//! Code that holds more than one shard lock must first hold the
//! [`StealPermit`], then lock shards in ascending index order. Code holding
//! a single shard lock never waits for another lock except the tick
//! counter's. No shard lock is held while waiting for a data lock or the
//! steal permit.

use crate::shard::Shard;
use crate::slot::{DataLock, SlotMeta};
use bcache_types::{BlockNumber, CacheGeometry, SlotId};
use parking_lot::{Mutex, MutexGuard};
use tracing::info;

/// Proof that the caller holds the steal coordination lock.
pub(crate) struct StealPermit<'t> {
    _guard: MutexGuard<'t, ()>,
}

/// Consistent view of a slot's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Located {
    pub(crate) shard: usize,
    pub(crate) meta: SlotMeta,
}

#[derive(Debug)]
pub(crate) struct ShardTable {
    geometry: CacheGeometry,
    shards: Box<[Mutex<Shard>]>,
    steal_lock: Mutex<()>,
    data: Box<[DataLock]>,
}

impl ShardTable {
    /// Build the pool and deal slots round-robin across shards.
    pub(crate) fn new(geometry: CacheGeometry) -> Self {
        let shard_count = geometry.shard_count() as usize;
        let mut members: Vec<Vec<SlotMeta>> = (0..shard_count).map(|_| Vec::new()).collect();
        for raw in 0..geometry.slot_count() {
            let id = SlotId(raw);
            members[geometry.initial_shard_of(id)].push(SlotMeta::new(id));
        }
        let shards = members
            .into_iter()
            .map(|m| Mutex::new(Shard::with_members(m)))
            .collect();
        let block_size = geometry.block_size().bytes();
        let data = (0..geometry.slot_count())
            .map(|_| DataLock::new(block_size))
            .collect();
        info!(
            slot_count = geometry.slot_count(),
            shard_count,
            block_size,
            "shard_table: initialized"
        );
        Self {
            geometry,
            shards,
            steal_lock: Mutex::new(()),
            data,
        }
    }

    pub(crate) fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Home shard of `block`.
    #[inline]
    pub(crate) fn shard_index(&self, block: BlockNumber) -> usize {
        self.geometry.shard_of(block)
    }

    pub(crate) fn lock_shard(&self, idx: usize) -> MutexGuard<'_, Shard> {
        self.shards[idx].lock()
    }

    pub(crate) fn begin_steal(&self) -> StealPermit<'_> {
        StealPermit {
            _guard: self.steal_lock.lock(),
        }
    }

    /// Lock shards `a` and `b` in ascending index order.
    ///
    /// Guards come back in argument order. `a` and `b` must differ.
    pub(crate) fn lock_pair(
        &self,
        _permit: &StealPermit<'_>,
        a: usize,
        b: usize,
    ) -> (MutexGuard<'_, Shard>, MutexGuard<'_, Shard>) {
        assert_ne!(a, b, "lock_pair on a single shard");
        if a < b {
            let first = self.shards[a].lock();
            let second = self.shards[b].lock();
            (first, second)
        } else {
            let first = self.shards[b].lock();
            let second = self.shards[a].lock();
            (second, first)
        }
    }

    /// Lock every shard in ascending order under the permit.
    fn lock_all(&self, _permit: &StealPermit<'_>) -> Vec<MutexGuard<'_, Shard>> {
        self.shards.iter().map(|s| s.lock()).collect()
    }

    pub(crate) fn data_lock(&self, slot: SlotId) -> &DataLock {
        &self.data[slot.index()]
    }

    /// Member count of each shard, taken as one consistent snapshot.
    pub(crate) fn occupancy(&self) -> Vec<usize> {
        let permit = self.begin_steal();
        self.lock_all(&permit).iter().map(|s| s.len()).collect()
    }

    /// Find a slot's current shard and metadata.
    pub(crate) fn locate(&self, slot: SlotId) -> Option<Located> {
        let permit = self.begin_steal();
        let guards = self.lock_all(&permit);
        guards.iter().enumerate().find_map(|(shard, guard)| {
            guard
                .members()
                .iter()
                .find(|m| m.id == slot)
                .map(|meta| Located {
                    shard,
                    meta: meta.clone(),
                })
        })
    }
}
