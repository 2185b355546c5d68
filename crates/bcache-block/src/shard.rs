//! One partition of the slot pool.
//!
//! A shard owns the metadata of its member slots in an ordered `Vec`.
//! Everything here runs under the shard's lock; none of it blocks.

use crate::slot::{BlockKey, SlotMeta};
use crate::table::StealPermit;
use bcache_types::SlotId;

#[derive(Debug, Default)]
pub(crate) struct Shard {
    members: Vec<SlotMeta>,
}

impl Shard {
    pub(crate) fn with_members(members: Vec<SlotMeta>) -> Self {
        Self { members }
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn members(&self) -> &[SlotMeta] {
        &self.members
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> Option<&mut SlotMeta> {
        self.members.iter_mut().find(|m| m.id == id)
    }

    /// If `key` is cached here, take a reference on it.
    ///
    /// Returns the slot and its claim epoch.
    pub(crate) fn reference_cached(&mut self, key: BlockKey) -> Option<(SlotId, u64)> {
        let meta = self.members.iter_mut().find(|m| m.key == Some(key))?;
        meta.refcount += 1;
        Some((meta.id, meta.epoch))
    }

    /// Position of the least recently idled unreferenced member.
    ///
    /// Ties go to the earliest member in list order.
    pub(crate) fn lru_idle(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, meta) in self.members.iter().enumerate() {
            if !meta.is_idle() {
                continue;
            }
            if best.is_none_or(|(_, tick)| meta.last_idle_tick < tick) {
                best = Some((idx, meta.last_idle_tick));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Position of the first unreferenced member, LRU or not.
    pub(crate) fn first_idle(&self) -> Option<usize> {
        self.members.iter().position(SlotMeta::is_idle)
    }

    /// Evict the LRU idle member in place and claim it for `key`.
    pub(crate) fn claim_lru(&mut self, key: BlockKey) -> Option<(SlotId, u64)> {
        let idx = self.lru_idle()?;
        let meta = &mut self.members[idx];
        let epoch = meta.claim(key);
        Some((meta.id, epoch))
    }

    /// Drop identity from every unreferenced member matching `pred`.
    ///
    /// Idle ticks are left alone; only a release moves them.
    pub(crate) fn forget_idle_where(&mut self, pred: impl Fn(&BlockKey) -> bool) -> usize {
        let mut dropped = 0;
        for meta in &mut self.members {
            if meta.is_idle() && meta.key.as_ref().is_some_and(&pred) {
                meta.key = None;
                dropped += 1;
            }
        }
        dropped
    }

    fn take(&mut self, idx: usize) -> SlotMeta {
        self.members.remove(idx)
    }

    fn push(&mut self, meta: SlotMeta) {
        self.members.push(meta);
    }
}

/// Move the first unreferenced member of `donor` to the end of `recipient`
/// and claim it for `key`.
///
/// Requires the steal permit and both shard guards, taken in ascending
/// shard order. Returns the moved slot and its new claim epoch.
pub(crate) fn steal(
    _permit: &StealPermit<'_>,
    donor: &mut Shard,
    recipient: &mut Shard,
    key: BlockKey,
) -> Option<(SlotId, u64)> {
    let idx = donor.first_idle()?;
    let mut meta = donor.take(idx);
    let epoch = meta.claim(key);
    let id = meta.id;
    recipient.push(meta);
    Some((id, epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_types::{BlockNumber, DeviceId};

    fn key(block: u64) -> BlockKey {
        BlockKey::new(DeviceId(1), BlockNumber(block))
    }

    fn meta(id: u32, refcount: u32, last_idle_tick: u64) -> SlotMeta {
        SlotMeta {
            id: SlotId(id),
            key: Some(key(u64::from(id) + 100)),
            refcount,
            last_idle_tick,
            epoch: 1,
        }
    }

    #[test]
    fn lru_picks_smallest_idle_tick_and_skips_referenced() {
        // Y (tick 9), X (tick 5), Z (referenced, tick 1).
        let shard = Shard::with_members(vec![meta(1, 0, 9), meta(0, 0, 5), meta(2, 2, 1)]);
        assert_eq!(shard.lru_idle(), Some(1));
        assert_eq!(shard.members()[1].id, SlotId(0));
    }

    #[test]
    fn lru_breaks_ties_by_list_order() {
        let shard = Shard::with_members(vec![meta(0, 1, 0), meta(1, 0, 4), meta(2, 0, 4)]);
        assert_eq!(shard.lru_idle(), Some(1));
    }

    #[test]
    fn lru_none_when_everything_referenced() {
        let shard = Shard::with_members(vec![meta(0, 1, 0), meta(1, 3, 0)]);
        assert_eq!(shard.lru_idle(), None);
        assert_eq!(shard.first_idle(), None);
    }

    #[test]
    fn reference_cached_bumps_refcount() {
        let mut shard = Shard::with_members(vec![meta(0, 0, 0)]);
        let (id, epoch) = shard.reference_cached(key(100)).expect("cached");
        assert_eq!(id, SlotId(0));
        assert_eq!(epoch, 1);
        assert_eq!(shard.members()[0].refcount, 1);
        assert!(shard.reference_cached(key(5)).is_none());
    }

    #[test]
    fn claim_lru_reuses_in_place() {
        let mut shard = Shard::with_members(vec![meta(0, 0, 7), meta(1, 0, 3)]);
        let (id, epoch) = shard.claim_lru(key(42)).expect("claim");
        assert_eq!(id, SlotId(1));
        assert_eq!(epoch, 2);
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.members()[1].key, Some(key(42)));
        assert_eq!(shard.members()[1].refcount, 1);
    }

    #[test]
    fn forget_idle_where_leaves_referenced_slots() {
        let mut shard = Shard::with_members(vec![meta(0, 0, 5), meta(1, 1, 5)]);
        assert_eq!(shard.forget_idle_where(|k| k.device == DeviceId(1)), 1);
        assert_eq!(shard.members()[0].key, None);
        assert_eq!(shard.members()[0].last_idle_tick, 5);
        assert!(shard.members()[1].key.is_some());
    }
}
