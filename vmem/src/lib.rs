//! vmem - Virtual Memory reservation manager
//!
//! Reserves ranges of device virtual address space, maps physical device memory into them and
//! controls access to the mapped ranges. All of the real work is delegated to a [`Backend`], which
//! is injected through the [`Context`] a reservation is created in.

pub mod access;
pub mod addr;
pub mod backend;
pub mod context;
pub mod error;
pub mod granularity;
pub mod physical;
pub mod range;
pub mod reservation;

#[cfg(test)]
pub(crate) mod test_common;

pub use access::{AccessMode, VirtualAccessFlags};
pub use addr::VirtAddr;
pub use backend::{
    Backend, BackendError, ContextHandle, DeviceHandle, GranularityKind, PhysicalHandle,
};
pub use context::{Context, Device, DeviceAspects};
pub use error::VmemError;
pub use granularity::{mem_granularity, minimum_mem_granularity, recommended_mem_granularity};
pub use physical::{PhysicalMemId, PhysicalMemory};
pub use range::VirtualAddressRange;
pub use reservation::{MappedRange, VirtualAddressReservation};

pub use log;
