//! Virtual address reservations.
//!
//! A [`VirtualAddressReservation`] owns a range of device virtual address space and tracks which
//! sub-ranges of it currently have physical memory mapped. The tracked ranges never overlap, and
//! every range in one reservation shares a single access mode:
//!
//! - The mode is pinned by the first successful map, or explicitly by
//!   [`VirtualAddressReservation::set_access_mode`].
//! - Mapping with a different mode fails with [`VmemError::AccessModeMismatch`].
//! - Once the last range is unmapped, the pin is cleared again.
//!
//! All operations on one reservation are serialised by a single lock, which is held across the
//! backend call so that checking and updating the tracked ranges is atomic.

use core::fmt;

use log::{debug, error, warn};
use spin::relax::Yield;

use crate::{
    AccessMode, Context, PhysicalMemory, VirtAddr, VirtualAccessFlags, VirtualAddressRange,
    VmemError,
};

/// The reservation lock may be held across driver calls, so yield instead of burning the core.
type ReservationLock<T> = spin::mutex::Mutex<T, Yield>;

/// A sub-range of a reservation that has physical memory mapped into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRange {
    range: VirtualAddressRange,
    physical: PhysicalMemory,
    physical_offset: usize,
}

impl MappedRange {
    /// The absolute virtual range that is mapped.
    pub fn range(&self) -> VirtualAddressRange {
        self.range
    }

    /// The absolute start of the mapped range.
    pub fn start(&self) -> VirtAddr {
        self.range.start
    }

    /// The size of the mapped range in bytes.
    pub fn size(&self) -> usize {
        self.range.size
    }

    /// The physical memory backing the range.
    pub fn physical(&self) -> &PhysicalMemory {
        &self.physical
    }

    /// The offset into the physical memory the range starts at.
    pub fn physical_offset(&self) -> usize {
        self.physical_offset
    }
}

#[derive(Debug, Default)]
struct MappingState {
    /// Kept in mapping order.
    ranges: Vec<MappedRange>,
    mode: Option<AccessMode>,
}

impl MappingState {
    fn remove(&mut self, index: usize) -> MappedRange {
        let removed = self.ranges.remove(index);
        if self.ranges.is_empty() {
            self.mode = None;
        }
        removed
    }
}

/// A reserved range of virtual address space.
///
/// The reservation is released when dropped: every mapped range is unmapped and the address range
/// is freed. Failures at that point are logged, not reported.
///
/// The type is `Send + Sync`; share it between threads behind an `Arc`.
pub struct VirtualAddressReservation {
    range: VirtualAddressRange,
    context: Context,
    state: ReservationLock<MappingState>,
}

impl VirtualAddressReservation {
    /// Reserves `num_bytes` of virtual address space in `context`.
    ///
    /// `requested_start` is a hint for the backend. The reservation may start elsewhere, see
    /// [`VirtualAddressReservation::start`].
    pub fn new(
        requested_start: Option<VirtAddr>,
        num_bytes: usize,
        context: &Context,
    ) -> Result<Self, VmemError> {
        for device in context.devices() {
            device.require_virtual_mem()?;
        }
        if num_bytes == 0 {
            return Err(VmemError::InvalidRange("cannot reserve an empty range"));
        }

        let start = context
            .backend()
            .reserve(context.handle(), requested_start, num_bytes)?;
        let Some(range) = VirtualAddressRange::try_new(start, num_bytes) else {
            if let Err(e) = context.backend().free(context.handle(), start, num_bytes) {
                error!("Failed to free unusable reservation at {}: {}", start, e);
            }
            return Err(VmemError::InvalidRange(
                "backend returned a reservation past the end of the address space",
            ));
        };

        match requested_start {
            Some(requested) if requested != start => {
                debug!("Reserved {} (requested start {} was not honoured)", range, requested)
            }
            _ => debug!("Reserved {}", range),
        }

        Ok(Self {
            range,
            context: context.clone(),
            state: ReservationLock::new(MappingState::default()),
        })
    }

    /// Maps `range_size` bytes of `physical`, starting at `physical_offset`, to the sub-range
    /// starting `range_offset` bytes into the reservation. Returns the absolute start of the mapping.
    pub fn map(
        &self,
        range_offset: usize,
        range_size: usize,
        physical: &PhysicalMemory,
        physical_offset: usize,
        mode: AccessMode,
    ) -> Result<VirtAddr, VmemError> {
        self.map_inner(range_offset, range_size, physical, physical_offset, Some(mode))
    }

    /// Like [`VirtualAddressReservation::map`], using the reservation's current access mode, or
    /// [`AccessMode::None`] if it has none yet.
    pub fn map_range(
        &self,
        range_offset: usize,
        range_size: usize,
        physical: &PhysicalMemory,
        physical_offset: usize,
    ) -> Result<VirtAddr, VmemError> {
        self.map_inner(range_offset, range_size, physical, physical_offset, None)
    }

    /// Maps `physical`, starting at `physical_offset`, over the whole reservation.
    pub fn map_whole(
        &self,
        physical: &PhysicalMemory,
        physical_offset: usize,
    ) -> Result<VirtAddr, VmemError> {
        self.map_inner(0, self.range.size, physical, physical_offset, None)
    }

    fn map_inner(
        &self,
        range_offset: usize,
        range_size: usize,
        physical: &PhysicalMemory,
        physical_offset: usize,
        mode: Option<AccessMode>,
    ) -> Result<VirtAddr, VmemError> {
        let range = self.sub_range(range_offset, range_size)?;
        match physical_offset.checked_add(range_size) {
            Some(end) if end <= physical.size() => {}
            _ => {
                return Err(VmemError::InvalidRange(
                    "specified range is outside the physical memory",
                ));
            }
        }
        if physical.context() != &self.context {
            return Err(VmemError::InvalidArgument(
                "physical memory belongs to a different context",
            ));
        }

        let mut state = self.state.lock();
        if state.ranges.iter().any(|mapped| mapped.range.overlaps(&range)) {
            return Err(VmemError::AlreadyMapped {
                start: range.start,
                size: range.size,
            });
        }
        let mode = match (mode, state.mode) {
            (Some(requested), Some(current)) if requested != current => {
                return Err(VmemError::AccessModeMismatch { requested, current });
            }
            (Some(requested), _) => requested,
            (None, current) => current.unwrap_or_default(),
        };

        self.context.backend().map(
            self.context.handle(),
            range.start,
            range.size,
            physical.handle(),
            physical_offset,
            VirtualAccessFlags::from(mode),
        )?;
        debug!(
            "Mapped {} to {:?}+{:#x} as {}",
            range,
            physical.id(),
            physical_offset,
            mode
        );

        state.ranges.push(MappedRange {
            range,
            physical: physical.clone(),
            physical_offset,
        });
        state.mode = Some(mode);
        Ok(range.start)
    }

    /// Unmaps every mapped range.
    ///
    /// Ranges are unmapped in the order they were mapped. If the backend fails on one, this stops:
    /// the ranges before it are unmapped and forgotten, the failing range and every range after it
    /// stay mapped and tracked.
    pub fn unmap_all(&self) -> Result<(), VmemError> {
        let mut state = self.state.lock();
        let mut unmapped = 0;
        let mut result = Ok(());
        for mapped in &state.ranges {
            if let Err(e) = self.context.backend().unmap(
                self.context.handle(),
                mapped.range.start,
                mapped.range.size,
            ) {
                warn!(
                    "Unmapping {} failed, {} range(s) remain mapped",
                    mapped.range,
                    state.ranges.len() - unmapped
                );
                result = Err(VmemError::from(e));
                break;
            }
            unmapped += 1;
        }

        if unmapped > 0 {
            state.ranges.drain(..unmapped);
            if state.ranges.is_empty() {
                state.mode = None;
            }
            debug!("Unmapped {} range(s) from {}", unmapped, self.range);
        }
        result
    }

    /// Unmaps the range that starts `range_offset` bytes into the reservation.
    pub fn unmap_at(&self, range_offset: usize) -> Result<(), VmemError> {
        let mut state = self.state.lock();
        let index = self
            .range
            .start
            .checked_add(range_offset)
            .and_then(|start| state.ranges.iter().position(|m| m.range.start == start))
            .ok_or(VmemError::InvalidArgument(
                "no range at the specified offset is currently mapped",
            ))?;
        self.unmap_index(&mut state, index)
    }

    /// Unmaps the range backed by `physical`.
    ///
    /// If the same physical memory is mapped at several places, only the earliest mapping is removed.
    pub fn unmap_physical(&self, physical: &PhysicalMemory) -> Result<(), VmemError> {
        let mut state = self.state.lock();
        let index = state
            .ranges
            .iter()
            .position(|m| m.physical.id() == physical.id())
            .ok_or(VmemError::InvalidArgument(
                "no range is currently mapped to the specified physical memory",
            ))?;
        self.unmap_index(&mut state, index)
    }

    fn unmap_index(&self, state: &mut MappingState, index: usize) -> Result<(), VmemError> {
        let range = state.ranges[index].range;
        self.context
            .backend()
            .unmap(self.context.handle(), range.start, range.size)?;
        let removed = state.remove(index);
        debug!("Unmapped {} from {:?}", range, removed.physical.id());
        Ok(())
    }

    /// Applies `mode` to every mapped range and makes it the mode of the reservation.
    ///
    /// With nothing mapped this only pins the mode for the next map. If the backend fails part way,
    /// the ranges already changed are put back to the previous mode on a best effort basis.
    pub fn set_access_mode(&self, mode: AccessMode) -> Result<(), VmemError> {
        let flags = VirtualAccessFlags::from(mode);
        let backend = self.context.backend();
        let mut state = self.state.lock();

        for (index, mapped) in state.ranges.iter().enumerate() {
            let Err(e) =
                backend.set_access(self.context.handle(), mapped.range.start, mapped.range.size, flags)
            else {
                continue;
            };

            let previous = VirtualAccessFlags::from(state.mode.unwrap_or_default());
            for changed in &state.ranges[..index] {
                if let Err(e) = backend.set_access(
                    self.context.handle(),
                    changed.range.start,
                    changed.range.size,
                    previous,
                ) {
                    error!("Failed to restore access flags of {}: {}", changed.range, e);
                }
            }
            return Err(e.into());
        }

        state.mode = Some(mode);
        debug!("Set access mode of {} to {}", self.range, mode);
        Ok(())
    }

    /// Queries the access mode of the mapped ranges.
    ///
    /// Fails with [`VmemError::NoMapping`] if nothing is mapped.
    pub fn access_mode(&self) -> Result<AccessMode, VmemError> {
        let state = self.state.lock();
        let first = state.ranges.first().ok_or(VmemError::NoMapping)?;
        let flags = self.context.backend().get_access(
            self.context.handle(),
            first.range.start,
            first.range.size,
        )?;
        Ok(AccessMode::from(flags))
    }

    /// A snapshot of the currently mapped ranges, in mapping order.
    pub fn mapped_ranges(&self) -> Vec<MappedRange> {
        self.state.lock().ranges.clone()
    }

    /// Returns true if any range is mapped.
    pub fn is_mapped(&self) -> bool {
        !self.state.lock().ranges.is_empty()
    }

    /// The start of the reserved range.
    pub fn start(&self) -> VirtAddr {
        self.range.start
    }

    /// The size of the reserved range in bytes.
    pub fn size(&self) -> usize {
        self.range.size
    }

    /// The whole reserved range.
    pub fn range(&self) -> VirtualAddressRange {
        self.range
    }

    /// The context the range was reserved in.
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn sub_range(
        &self,
        range_offset: usize,
        range_size: usize,
    ) -> Result<VirtualAddressRange, VmemError> {
        if range_size == 0 {
            return Err(VmemError::InvalidRange("cannot map an empty range"));
        }
        match range_offset.checked_add(range_size) {
            Some(end) if end <= self.range.size => Ok(VirtualAddressRange::new(
                self.range.start + range_offset,
                range_size,
            )),
            _ => Err(VmemError::InvalidRange(
                "specified range is outside the reserved address range",
            )),
        }
    }
}

impl fmt::Debug for VirtualAddressReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualAddressReservation")
            .field("range", &self.range)
            .field("context", &self.context.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for VirtualAddressReservation {
    fn drop(&mut self) {
        let backend = self.context.backend();
        let handle = self.context.handle();
        let state = self.state.get_mut();

        for mapped in state.ranges.drain(..) {
            if let Err(e) = backend.unmap(handle, mapped.range.start, mapped.range.size) {
                error!("Failed to unmap {} while releasing {}: {}", mapped.range, self.range, e);
            }
        }
        state.mode = None;

        match backend.free(handle, self.range.start, self.range.size) {
            Ok(()) => debug!("Released {}", self.range),
            Err(e) => error!("Failed to free {}: {}", self.range, e),
        }
    }
}
