#![forbid(unsafe_code)]
//! Sharded block buffer cache.
//!
//! A fixed pool of block-sized slots is partitioned into shards, each
//! guarded by its own short-hold lock, so lookups of blocks hashing to
//! different shards never contend. A shard that runs out of unreferenced
//! slots takes one from another shard under a single steal permit.
//! Each slot also carries a long-hold data lock that serializes access to
//! the cached bytes, and the device transport is only ever called with that
//! lock held and no shard lock held.
//!
//! ```text
//!   acquire(dev, blk)
//!        │
//!        ▼
//!   home shard  ──hit──────────────► data lock ─► SlotHandle
//!        │ miss
//!        ├──idle LRU slot (reuse)──► data lock ─► SlotHandle
//!        │ none
//!        ▼
//!   steal permit + (home, donor) pair ──► move slot ─► data lock
//!        │ no donor has a free slot
//!        ▼
//!   CacheExhausted
//! ```

pub mod cache;
pub mod device;
pub mod metrics;
mod shard;
pub mod slot;
mod table;
pub mod tick;
pub mod transport;

pub use cache::{BufferCache, SlotHandle, SlotPin, SlotState};
pub use device::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemByteDevice};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use slot::{BlockKey, SlotData};
pub use tick::{ManualTicks, MonotonicTicks, TickSource};
pub use transport::{BlockTransport, DeviceTable};

use bcache_error::BcacheError;
use bcache_types::ParseError;

/// Map a configuration [`ParseError`] onto the cache error type.
#[must_use]
pub fn geometry_error(err: ParseError) -> BcacheError {
    BcacheError::InvalidGeometry(err.to_string())
}
