//! Device-addressed block transport consumed by the cache.
//!
//! The cache only ever talks to a [`BlockTransport`]: a synchronous read or
//! write of one whole block, addressed by `(device, block)`. Calls are made
//! while the caller holds the target slot's data lock and no shard lock, so
//! implementations may block for as long as the device needs.

use crate::device::BlockDevice;
use bcache_error::{BcacheError, Result};
use bcache_types::{BlockNumber, BlockSize, DeviceId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub trait BlockTransport: Send + Sync {
    /// Size of every block moved through this transport.
    fn block_size(&self) -> BlockSize;

    /// Fill `buf` with the contents of `(device, block)`.
    fn sync_read(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to `(device, block)`.
    fn sync_write(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()>;
}

impl<T: BlockTransport + ?Sized> BlockTransport for Arc<T> {
    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn sync_read(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        (**self).sync_read(device, block, buf)
    }

    fn sync_write(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        (**self).sync_write(device, block, buf)
    }
}

/// Routes `(device, block)` requests to registered [`BlockDevice`]s.
///
/// All attached devices share one block size.
pub struct DeviceTable {
    block_size: BlockSize,
    devices: RwLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
}

impl DeviceTable {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a device under `id`, replacing any device previously attached
    /// under the same id.
    pub fn attach(&self, id: DeviceId, device: Arc<dyn BlockDevice>) -> Result<()> {
        if device.block_size() != self.block_size {
            return Err(BcacheError::Format(format!(
                "device {id} block size {} does not match table block size {}",
                device.block_size(),
                self.block_size
            )));
        }
        info!(
            device = %id,
            block_count = device.block_count(),
            "device_table: attach"
        );
        self.devices.write().insert(id, device);
        Ok(())
    }

    /// Detach a device. Returns `false` if nothing was attached under `id`.
    pub fn detach(&self, id: DeviceId) -> bool {
        self.devices.write().remove(&id).is_some()
    }

    /// Number of attached devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Flush every attached device.
    pub fn sync_all(&self) -> Result<()> {
        let devices: Vec<Arc<dyn BlockDevice>> = self.devices.read().values().cloned().collect();
        for device in devices {
            device.sync()?;
        }
        Ok(())
    }

    fn lookup(&self, id: DeviceId) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or(BcacheError::UnknownDevice(id.0))
    }
}

impl std::fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTable")
            .field("block_size", &self.block_size)
            .field("devices", &self.devices.read().len())
            .finish()
    }
}

impl BlockTransport for DeviceTable {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn sync_read(&self, device: DeviceId, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        // Clone the Arc so the table lock is not held across device I/O.
        self.lookup(device)?.read_block(block, buf)
    }

    fn sync_write(&self, device: DeviceId, block: BlockNumber, buf: &[u8]) -> Result<()> {
        self.lookup(device)?.write_block(block, buf)
    }
}
