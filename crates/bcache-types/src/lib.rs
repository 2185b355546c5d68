#![forbid(unsafe_code)]
//! Identifier newtypes and cache geometry shared by the bcache crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest block size the cache accepts (one disk sector).
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest block size the cache accepts.
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// Default number of slots in the pool.
pub const DEFAULT_SLOT_COUNT: u32 = 30;
/// Default number of shards. Prime, so sequential block numbers spread evenly.
pub const DEFAULT_SHARD_COUNT: u32 = 13;
/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Upper bound used when the shard count is auto-detected.
const AUTO_SHARD_LIMIT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Stable device identifier.
///
/// Typically derived from an on-disk UUID, but any caller-chosen value works
/// as long as it is unique per attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u128);

impl DeviceId {
    #[must_use]
    pub fn from_uuid_bytes_be(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    #[must_use]
    pub fn to_uuid_bytes_be(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

/// Index of a slot in the fixed pool. Stable for the lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Validated block size (power of two in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<ByteOffset> {
        block.0.checked_mul(u64::from(self.0)).map(ByteOffset)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Configuration ───────────────────────────────────────────────────────────

/// User-facing cache configuration.
///
/// Deserializable from JSON so the CLI can load it from a file. Call
/// [`CacheConfig::validate`] to obtain the immutable [`CacheGeometry`] the
/// cache is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total number of slots in the pool.
    pub slot_count: u32,
    /// Number of shards (0 = auto-detect from available parallelism).
    pub shard_count: u32,
    /// Block size in bytes.
    pub block_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            shard_count: DEFAULT_SHARD_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl CacheConfig {
    /// Resolved number of shards.
    ///
    /// An explicit value is returned unchanged; `0` picks the available
    /// parallelism, capped at 16 and at `slot_count`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // .min(16) always fits u32
    pub fn resolved_shards(&self) -> u32 {
        if self.shard_count == 0 {
            let cores = std::thread::available_parallelism()
                .map_or(4, |n| n.get().min(AUTO_SHARD_LIMIT as usize) as u32);
            cores.min(self.slot_count)
        } else {
            self.shard_count
        }
    }

    /// Check the configuration and freeze it into a [`CacheGeometry`].
    pub fn validate(&self) -> Result<CacheGeometry, ParseError> {
        if self.slot_count == 0 {
            return Err(ParseError::InvalidField {
                field: "slot_count",
                reason: "must be > 0",
            });
        }
        let shard_count = self.resolved_shards();
        if shard_count == 0 {
            return Err(ParseError::InvalidField {
                field: "shard_count",
                reason: "must be > 0",
            });
        }
        if shard_count > self.slot_count {
            return Err(ParseError::InvalidField {
                field: "shard_count",
                reason: "must not exceed slot_count",
            });
        }
        let block_size = BlockSize::new(self.block_size)?;
        Ok(CacheGeometry {
            slot_count: self.slot_count,
            shard_count,
            block_size,
        })
    }
}

/// Validated, immutable cache geometry fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheGeometry {
    slot_count: u32,
    shard_count: u32,
    block_size: BlockSize,
}

impl CacheGeometry {
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Map a block number to its home shard.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // remainder < shard_count: u32
    pub fn shard_of(&self, block: BlockNumber) -> usize {
        (block.0 % u64::from(self.shard_count)) as usize
    }

    /// Shard a slot is placed in at startup (round-robin).
    #[inline]
    #[must_use]
    pub fn initial_shard_of(&self, slot: SlotId) -> usize {
        (slot.0 % self.shard_count) as usize
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
