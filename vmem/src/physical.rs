//! Physical device memory allocations.

use core::{
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
};
use std::sync::Arc;

use log::{debug, error};

use crate::{Context, Device, PhysicalHandle, VmemError};

static NEXT_PHYSICAL_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique identity for a physical allocation. Clones of a [`PhysicalMemory`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalMemId(u64);

impl PhysicalMemId {
    fn next() -> Self {
        PhysicalMemId(NEXT_PHYSICAL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier value.
    pub fn value(self) -> u64 {
        self.0
    }
}

struct PhysicalInner {
    id: PhysicalMemId,
    handle: PhysicalHandle,
    num_bytes: usize,
    device: Device,
    context: Context,
}

impl Drop for PhysicalInner {
    fn drop(&mut self) {
        debug!("Releasing physical memory {:?} ({:#x} bytes)", self.id, self.num_bytes);
        if let Err(e) = self
            .context
            .backend()
            .physical_release(self.context.handle(), self.handle)
        {
            error!("Failed to release physical memory {:?}: {}", self.id, e);
        }
    }
}

/// A fixed size allocation of physical memory on a device.
///
/// Cloning shares the allocation, which is released once the last clone is dropped. A reservation
/// keeps a clone for as long as the memory is mapped into it.
#[derive(Clone)]
pub struct PhysicalMemory {
    inner: Arc<PhysicalInner>,
}

impl PhysicalMemory {
    /// Allocates `num_bytes` of physical memory on `device`, which must be part of `context`.
    ///
    /// Backends usually require `num_bytes` to be a multiple of the minimum granularity, see
    /// [`crate::minimum_mem_granularity`].
    pub fn new(device: &Device, context: &Context, num_bytes: usize) -> Result<Self, VmemError> {
        device.require_virtual_mem()?;
        if !context.contains(device) {
            return Err(VmemError::InvalidArgument(
                "device is not part of the context",
            ));
        }
        if num_bytes == 0 {
            return Err(VmemError::InvalidRange("physical memory cannot be empty"));
        }

        let handle = context
            .backend()
            .physical_create(context.handle(), device.handle(), num_bytes)?;
        let id = PhysicalMemId::next();
        debug!("Allocated physical memory {:?} ({:#x} bytes) on {}", id, num_bytes, device);
        Ok(Self {
            inner: Arc::new(PhysicalInner {
                id,
                handle,
                num_bytes,
                device: device.clone(),
                context: context.clone(),
            }),
        })
    }

    /// The identity of the allocation.
    pub fn id(&self) -> PhysicalMemId {
        self.inner.id
    }

    /// The backend handle of the allocation.
    pub fn handle(&self) -> PhysicalHandle {
        self.inner.handle
    }

    /// The size of the allocation in bytes.
    pub fn size(&self) -> usize {
        self.inner.num_bytes
    }

    /// The device the memory lives on.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    /// The context the memory was allocated in.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }
}

impl PartialEq for PhysicalMemory {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for PhysicalMemory {}

impl Hash for PhysicalMemory {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .field("size", &self.inner.num_bytes)
            .field("device", &self.inner.device.name())
            .finish()
    }
}
