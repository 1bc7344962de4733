//! The driver interface every virtual memory operation is delegated to.
//!
//! A [`Backend`] is the plugin layer between this crate and a device driver. It owns the real
//! address space and physical allocations; this crate only keeps track of what it asked for.
//! Backends are expected to synchronise their own state, every method takes `&self`.

use core::fmt::Debug;

use crate::{Device, VirtAddr, VirtualAccessFlags};

/// Opaque backend handle for a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque backend handle for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque backend handle for a physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalHandle(pub u64);

/// Which memory granularity to query from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GranularityKind {
    /// The smallest size and alignment the device accepts.
    Minimum,
    /// The size and alignment the device performs best with.
    Recommended,
}

/// Failures reported by a backend. These are surfaced to the caller unchanged and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// No free range of the address space is large enough.
    #[error("Out of virtual address space: unable to reserve {requested:#x} bytes")]
    OutOfAddressSpace {
        /// Bytes asked for.
        requested: usize,
    },
    /// The device has no physical memory left for the allocation.
    #[error("Out of device memory: unable to allocate {requested:#x} bytes")]
    OutOfDeviceMemory {
        /// Bytes asked for.
        requested: usize,
    },
    /// A size, address or offset is not a multiple of the granularity.
    #[error("{value:#x} is not aligned to the {granularity:#x} byte granularity")]
    Misaligned {
        /// The offending value.
        value: usize,
        /// The granularity it had to be a multiple of.
        granularity: usize,
    },
    /// Part of the range already has memory mapped.
    #[error("Range at {start} of {size:#x} bytes is already mapped")]
    AlreadyMapped {
        /// Start of the requested range.
        start: VirtAddr,
        /// Size of the requested range.
        size: usize,
    },
    /// The range does not match a mapping.
    #[error("Range at {start} of {size:#x} bytes is not mapped")]
    NotMapped {
        /// Start of the requested range.
        start: VirtAddr,
        /// Size of the requested range.
        size: usize,
    },
    /// A handle that the backend does not know, or that belongs to another context.
    #[error("Invalid handle: {0}")]
    InvalidHandle(&'static str),
    /// An argument the backend cannot work with.
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),
    /// The call is not allowed in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The device lacks the capability.
    #[error("Operation not supported by the device")]
    Unsupported,
    /// A raw driver error code.
    #[error("Driver returned error code {0}")]
    Driver(i32),
}

/// A virtual memory capable driver.
///
/// Implementations must be thread safe. Callers serialise operations on a single reservation, but
/// different reservations in the same context may call into the backend concurrently.
pub trait Backend: Debug + Send + Sync {
    /// Enumerates the devices this backend drives.
    fn devices(&self) -> Result<Vec<Device>, BackendError>;

    /// Creates a context spanning `devices`.
    fn context_create(&self, devices: &[DeviceHandle]) -> Result<ContextHandle, BackendError>;

    /// Releases a context created with [`Backend::context_create`].
    fn context_release(&self, context: ContextHandle) -> Result<(), BackendError>;

    /// Reserves `num_bytes` of virtual address space. `requested_start` is a hint, the returned
    /// start may differ from it.
    fn reserve(
        &self,
        context: ContextHandle,
        requested_start: Option<VirtAddr>,
        num_bytes: usize,
    ) -> Result<VirtAddr, BackendError>;

    /// Releases a previously reserved range.
    fn free(&self, context: ContextHandle, start: VirtAddr, num_bytes: usize)
    -> Result<(), BackendError>;

    /// Maps `size` bytes of `physical`, starting at `physical_offset`, to `start`.
    fn map(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
        physical: PhysicalHandle,
        physical_offset: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError>;

    /// Unmaps a range previously mapped with [`Backend::map`].
    fn unmap(&self, context: ContextHandle, start: VirtAddr, size: usize)
    -> Result<(), BackendError>;

    /// Changes the access flags of a mapped range.
    fn set_access(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError>;

    /// Queries the access flags of a mapped range.
    fn get_access(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
    ) -> Result<VirtualAccessFlags, BackendError>;

    /// Queries the memory granularity of `device` within `context`.
    fn granularity(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        kind: GranularityKind,
    ) -> Result<usize, BackendError>;

    /// Allocates `num_bytes` of physical memory on `device`.
    fn physical_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        num_bytes: usize,
    ) -> Result<PhysicalHandle, BackendError>;

    /// Releases a physical allocation.
    fn physical_release(
        &self,
        context: ContextHandle,
        physical: PhysicalHandle,
    ) -> Result<(), BackendError>;
}
