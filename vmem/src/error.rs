//! The error type of the crate.
use crate::{AccessMode, BackendError, VirtAddr};

/// Errors returned by reservation, mapping and granularity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    /// The device cannot map virtual memory.
    #[error("Device {device} does not support virtual memory")]
    UnsupportedFeature {
        /// Name of the device.
        device: String,
    },
    /// An offset or size falls outside the reservation or the physical memory.
    #[error("Invalid range: {0}")]
    InvalidRange(&'static str),
    /// Nothing matches the argument, or it belongs to another context.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The range overlaps a range that is already mapped.
    #[error("Range at {start} of {size:#x} bytes overlaps an existing mapping")]
    AlreadyMapped {
        /// Start of the requested range.
        start: VirtAddr,
        /// Size of the requested range.
        size: usize,
    },
    /// The reservation is already mapped with another access mode.
    #[error("Reservation is mapped as {current}, cannot map as {requested}")]
    AccessModeMismatch {
        /// The mode passed to the map call.
        requested: AccessMode,
        /// The mode of the reservation.
        current: AccessMode,
    },
    /// The operation needs at least one mapped range.
    #[error("No range of the reservation is currently mapped")]
    NoMapping,
    /// The backend failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
