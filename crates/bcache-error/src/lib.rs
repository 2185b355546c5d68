#![forbid(unsafe_code)]
//! Error types for the bcache buffer cache.
//!
//! # Error Taxonomy
//!
//! | Variant | Origin | Recovery |
//! |---------|--------|----------|
//! | `Io` | block transport | caller decides retry policy; a failed read leaves the slot invalid |
//! | `Format` | device layer | bad offsets or buffer sizes, a caller bug or a truncated image |
//! | `InvalidGeometry` | startup | fix the configuration |
//! | `CacheExhausted` | `acquire` | every slot is referenced; release something or grow the pool |
//! | `ContractViolation` | handle misuse | none, the caller broke the locking contract |
//! | `UnknownDevice` | device table | attach the device first |
//! | `PermissionDenied` | device layer | image opened read-only |
//!
//! The cache never retries internally. Every failure is returned to the
//! caller with the cache left in the state it had before the failed step.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via
//! [`BcacheError::to_errno`]. The mapping is exhaustive (no wildcard arms)
//! so adding a variant is a compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `CacheExhausted` | `ENOBUFS` |
//! | `ContractViolation` | `EPERM` |
//! | `UnknownDevice` | `ENODEV` |
//! | `PermissionDenied` | `EACCES` |
//!
//! `bcache-error` does not depend on `bcache-types`; identifiers are carried
//! as raw integers and the `ParseError` conversion lives in `bcache-block`.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum BcacheError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request to the device layer (out-of-range block, wrong
    /// buffer length, unaligned image).
    #[error("invalid device access: {0}")]
    Format(String),

    /// Cache geometry rejected at startup.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No shard holds an unreferenced slot that could be reused.
    #[error("buffer cache exhausted: no free slot for device {device:032x} block {block}")]
    CacheExhausted { device: u128, block: u64 },

    /// A handle was used without holding the slot's data lock, or a pin was
    /// released on a slot with no outstanding references.
    #[error("buffer cache contract violation: {0}")]
    ContractViolation(&'static str),

    /// The transport has no device registered under this id.
    #[error("unknown device {0:032x}")]
    UnknownDevice(u128),

    /// Write attempted on a device opened read-only.
    #[error("permission denied")]
    PermissionDenied,
}

impl BcacheError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `CacheExhausted` -> `ENOBUFS`: the pool is out of buffers, a
    ///   transient condition from the caller's perspective.
    /// - `ContractViolation` -> `EPERM`: the operation is not permitted in
    ///   the handle's current lock state.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::CacheExhausted { .. } => libc::ENOBUFS,
            Self::ContractViolation(_) => libc::EPERM,
            Self::UnknownDevice(_) => libc::ENODEV,
            Self::PermissionDenied => libc::EACCES,
        }
    }

    /// True for failures that leave the cache usable and may succeed later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::CacheExhausted { .. })
    }
}

/// Result alias using `BcacheError`.
pub type Result<T> = std::result::Result<T, BcacheError>;
