//! An in-process device that keeps every reservation, mapping and physical allocation in memory.
use std::collections::{BTreeMap, HashMap};

use log::trace;
use spin::Mutex;
use vmem::{
    Backend, BackendError, ContextHandle, Device, DeviceAspects, DeviceHandle, GranularityKind,
    PhysicalHandle, VirtAddr, VirtualAccessFlags, VirtualAddressRange,
};

use crate::{
    config::{ConfigError, SimConfig},
    mapper::VirtualAddressMapper,
};

/// The operations of [`Backend`], used for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// [`Backend::devices`]
    Devices,
    /// [`Backend::context_create`]
    ContextCreate,
    /// [`Backend::context_release`]
    ContextRelease,
    /// [`Backend::reserve`]
    Reserve,
    /// [`Backend::free`]
    Free,
    /// [`Backend::map`]
    Map,
    /// [`Backend::unmap`]
    Unmap,
    /// [`Backend::set_access`]
    SetAccess,
    /// [`Backend::get_access`]
    GetAccess,
    /// [`Backend::granularity`]
    Granularity,
    /// [`Backend::physical_create`]
    PhysicalCreate,
    /// [`Backend::physical_release`]
    PhysicalRelease,
}

#[derive(Debug)]
struct SimReservation {
    context: ContextHandle,
    size: usize,
}

#[derive(Debug)]
struct SimMapping {
    context: ContextHandle,
    size: usize,
    physical: PhysicalHandle,
    flags: VirtualAccessFlags,
}

#[derive(Debug)]
struct SimPhysical {
    context: ContextHandle,
    device: DeviceHandle,
    size: usize,
}

#[derive(Debug)]
struct SimState {
    mapper: VirtualAddressMapper,
    next_handle: u64,
    contexts: HashMap<ContextHandle, Vec<DeviceHandle>>,
    reservations: BTreeMap<VirtAddr, SimReservation>,
    mappings: BTreeMap<VirtAddr, SimMapping>,
    physical: HashMap<PhysicalHandle, SimPhysical>,
    /// Bytes handed out per device.
    device_usage: HashMap<DeviceHandle, usize>,
    calls: HashMap<SimOp, usize>,
    faults: Vec<(SimOp, BackendError)>,
}

impl SimState {
    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn devices_of(&self, context: ContextHandle) -> Result<&[DeviceHandle], BackendError> {
        self.contexts
            .get(&context)
            .map(Vec::as_slice)
            .ok_or(BackendError::InvalidHandle("context"))
    }

    fn check_device(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
    ) -> Result<(), BackendError> {
        if self.devices_of(context)?.contains(&device) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle("device"))
        }
    }

    /// Finds the reservation of `context` that holds all of `range`.
    fn reservation_containing(
        &self,
        context: ContextHandle,
        range: VirtualAddressRange,
    ) -> Option<VirtualAddressRange> {
        let (start, reservation) = self.reservations.range(..=range.start).next_back()?;
        let reserved = VirtualAddressRange::new(*start, reservation.size);
        (reservation.context == context && reserved.contains_range(&range)).then_some(reserved)
    }

    fn overlaps_mapping(&self, range: VirtualAddressRange) -> bool {
        let before = self
            .mappings
            .range(..range.start)
            .next_back()
            .map(|(start, m)| VirtualAddressRange::new(*start, m.size));
        let after = self
            .mappings
            .range(range.start..)
            .next()
            .map(|(start, m)| VirtualAddressRange::new(*start, m.size));
        [before, after]
            .into_iter()
            .flatten()
            .any(|mapped| mapped.overlaps(&range))
    }

    /// The mapping that starts at `start` and spans exactly `size` bytes.
    fn exact_mapping(
        &mut self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
    ) -> Result<&mut SimMapping, BackendError> {
        match self.mappings.get_mut(&start) {
            Some(mapping) if mapping.size == size && mapping.context == context => Ok(mapping),
            _ => Err(BackendError::NotMapped { start, size }),
        }
    }
}

/// A [`Backend`] that simulates a device in process memory.
///
/// The address space is handed out lowest address first. Every size, start and offset has to be a
/// multiple of the configured minimum granularity. The backend counts calls per [`SimOp`] and can be
/// told to fail a call with [`SimulatedBackend::fail_next`].
#[derive(Debug)]
pub struct SimulatedBackend {
    config: SimConfig,
    devices: Vec<Device>,
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    /// Creates a backend for `config`. Devices get handles in configuration order, starting at 0.
    ///
    /// Fails if `config` does not pass [`SimConfig::validate`].
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let devices = config
            .devices
            .iter()
            .enumerate()
            .map(|(i, device)| {
                let aspects = if device.virtual_mem {
                    DeviceAspects::VIRTUAL_MEM
                } else {
                    DeviceAspects::empty()
                };
                Device::new(DeviceHandle(i as u64), device.name.clone(), aspects)
            })
            .collect();
        let state = SimState {
            mapper: VirtualAddressMapper::new(config.address_space),
            next_handle: 1,
            contexts: HashMap::new(),
            reservations: BTreeMap::new(),
            mappings: BTreeMap::new(),
            physical: HashMap::new(),
            device_usage: HashMap::new(),
            calls: HashMap::new(),
            faults: Vec::new(),
        };
        Ok(Self {
            config,
            devices,
            state: Mutex::new(state),
        })
    }

    /// The configuration the backend was created with.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// How many times `op` has been called, failed calls included.
    pub fn call_count(&self, op: SimOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Makes the next call of `op` fail with `error` without touching any state.
    pub fn fail_next(&self, op: SimOp, error: BackendError) {
        self.state.lock().faults.push((op, error));
    }

    /// Number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Number of live physical allocations.
    pub fn physical_count(&self) -> usize {
        self.state.lock().physical.len()
    }

    /// Number of live contexts.
    pub fn context_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Bytes of the address space that are not reserved.
    pub fn free_address_space(&self) -> usize {
        self.state.lock().mapper.free_bytes()
    }

    fn begin(&self, op: SimOp) -> Result<spin::MutexGuard<'_, SimState>, BackendError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(index) = state.faults.iter().position(|(o, _)| *o == op) {
            let (_, error) = state.faults.remove(index);
            trace!("{op:?}: injected failure {error}");
            return Err(error);
        }
        Ok(state)
    }

    fn check_aligned(&self, value: usize) -> Result<(), BackendError> {
        let granularity = self.config.minimum_granularity;
        if value % granularity == 0 {
            Ok(())
        } else {
            Err(BackendError::Misaligned { value, granularity })
        }
    }

    fn check_size(&self, size: usize) -> Result<(), BackendError> {
        if size == 0 {
            return Err(BackendError::InvalidValue("size must not be zero"));
        }
        self.check_aligned(size)
    }

    fn device(&self, handle: DeviceHandle) -> Result<&Device, BackendError> {
        self.devices
            .iter()
            .find(|d| d.handle() == handle)
            .ok_or(BackendError::InvalidHandle("device"))
    }
}

impl Backend for SimulatedBackend {
    fn devices(&self) -> Result<Vec<Device>, BackendError> {
        self.begin(SimOp::Devices)?;
        Ok(self.devices.clone())
    }

    fn context_create(&self, devices: &[DeviceHandle]) -> Result<ContextHandle, BackendError> {
        let mut state = self.begin(SimOp::ContextCreate)?;
        if devices.is_empty() {
            return Err(BackendError::InvalidValue("a context needs at least one device"));
        }
        for device in devices {
            self.device(*device)?;
        }
        let context = ContextHandle(state.next_handle());
        state.contexts.insert(context, devices.to_vec());
        trace!("context_create({devices:?}) -> {context:?}");
        Ok(context)
    }

    fn context_release(&self, context: ContextHandle) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::ContextRelease)?;
        state.devices_of(context)?;
        let in_use = state.reservations.values().any(|r| r.context == context)
            || state.physical.values().any(|p| p.context == context);
        if in_use {
            return Err(BackendError::InvalidOperation("context still owns resources"));
        }
        state.contexts.remove(&context);
        trace!("context_release({context:?})");
        Ok(())
    }

    fn reserve(
        &self,
        context: ContextHandle,
        requested_start: Option<VirtAddr>,
        num_bytes: usize,
    ) -> Result<VirtAddr, BackendError> {
        let mut state = self.begin(SimOp::Reserve)?;
        state.devices_of(context)?;
        self.check_size(num_bytes)?;

        let granularity = self.config.minimum_granularity;
        let requested = requested_start
            .filter(|start| !start.is_null() && start.is_aligned_to(granularity))
            .and_then(|start| VirtualAddressRange::try_new(start, num_bytes))
            .and_then(|range| state.mapper.allocate_at(range));
        let range = match requested {
            Some(range) => range,
            None => state
                .mapper
                .allocate(num_bytes, granularity)
                .ok_or(BackendError::OutOfAddressSpace {
                    requested: num_bytes,
                })?,
        };
        state.reservations.insert(
            range.start,
            SimReservation {
                context,
                size: range.size,
            },
        );
        trace!("reserve({requested_start:?}, {num_bytes:#x}) -> {range}");
        Ok(range.start)
    }

    fn free(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        num_bytes: usize,
    ) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::Free)?;
        match state.reservations.get(&start) {
            Some(r) if r.size == num_bytes && r.context == context => {}
            _ => return Err(BackendError::InvalidValue("no reservation at this range")),
        }
        let range = VirtualAddressRange::new(start, num_bytes);
        if state.overlaps_mapping(range) {
            return Err(BackendError::InvalidOperation("reservation still has mappings"));
        }
        state.reservations.remove(&start);
        state.mapper.deallocate(range);
        trace!("free({range})");
        Ok(())
    }

    fn map(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
        physical: PhysicalHandle,
        physical_offset: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::Map)?;
        state.devices_of(context)?;
        self.check_aligned(start.as_usize())?;
        self.check_size(size)?;
        self.check_aligned(physical_offset)?;

        let backing = state
            .physical
            .get(&physical)
            .filter(|p| p.context == context)
            .ok_or(BackendError::InvalidHandle("physical memory"))?;
        match physical_offset.checked_add(size) {
            Some(end) if end <= backing.size => {}
            _ => return Err(BackendError::InvalidValue("mapping exceeds the physical allocation")),
        }

        let range = VirtualAddressRange::try_new(start, size)
            .ok_or(BackendError::InvalidValue("range overflows the address space"))?;
        if state.reservation_containing(context, range).is_none() {
            return Err(BackendError::InvalidValue("range is not inside a reservation"));
        }
        if state.overlaps_mapping(range) {
            return Err(BackendError::AlreadyMapped { start, size });
        }
        state.mappings.insert(
            start,
            SimMapping {
                context,
                size,
                physical,
                flags,
            },
        );
        trace!("map({range}, {physical:?} + {physical_offset:#x}, {flags:?})");
        Ok(())
    }

    fn unmap(&self, context: ContextHandle, start: VirtAddr, size: usize) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::Unmap)?;
        state.exact_mapping(context, start, size)?;
        state.mappings.remove(&start);
        trace!("unmap({start}, {size:#x})");
        Ok(())
    }

    fn set_access(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::SetAccess)?;
        state.exact_mapping(context, start, size)?.flags = flags;
        trace!("set_access({start}, {size:#x}, {flags:?})");
        Ok(())
    }

    fn get_access(
        &self,
        context: ContextHandle,
        start: VirtAddr,
        size: usize,
    ) -> Result<VirtualAccessFlags, BackendError> {
        let mut state = self.begin(SimOp::GetAccess)?;
        let flags = state.exact_mapping(context, start, size)?.flags;
        trace!("get_access({start}, {size:#x}) -> {flags:?}");
        Ok(flags)
    }

    fn granularity(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        kind: GranularityKind,
    ) -> Result<usize, BackendError> {
        let state = self.begin(SimOp::Granularity)?;
        state.check_device(context, device)?;
        if !self.device(device)?.has(DeviceAspects::VIRTUAL_MEM) {
            return Err(BackendError::Unsupported);
        }
        Ok(match kind {
            GranularityKind::Minimum => self.config.minimum_granularity,
            GranularityKind::Recommended => self.config.recommended_granularity,
        })
    }

    fn physical_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        num_bytes: usize,
    ) -> Result<PhysicalHandle, BackendError> {
        let mut state = self.begin(SimOp::PhysicalCreate)?;
        state.check_device(context, device)?;
        let index = usize::try_from(device.0).map_err(|_| BackendError::InvalidHandle("device"))?;
        let config = self
            .config
            .devices
            .get(index)
            .ok_or(BackendError::InvalidHandle("device"))?;
        if !config.virtual_mem {
            return Err(BackendError::Unsupported);
        }
        self.check_size(num_bytes)?;

        let used = state.device_usage.get(&device).copied().unwrap_or(0);
        match used.checked_add(num_bytes) {
            Some(total) if total <= config.memory => {
                state.device_usage.insert(device, total);
            }
            _ => {
                return Err(BackendError::OutOfDeviceMemory {
                    requested: num_bytes,
                });
            }
        }

        let handle = PhysicalHandle(state.next_handle());
        state.physical.insert(
            handle,
            SimPhysical {
                context,
                device,
                size: num_bytes,
            },
        );
        trace!("physical_create({device:?}, {num_bytes:#x}) -> {handle:?}");
        Ok(handle)
    }

    fn physical_release(
        &self,
        context: ContextHandle,
        physical: PhysicalHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.begin(SimOp::PhysicalRelease)?;
        match state.physical.get(&physical) {
            Some(p) if p.context == context => {}
            _ => return Err(BackendError::InvalidHandle("physical memory")),
        }
        if state.mappings.values().any(|m| m.physical == physical) {
            return Err(BackendError::InvalidOperation("physical memory is still mapped"));
        }
        if let Some(released) = state.physical.remove(&physical) {
            if let Some(used) = state.device_usage.get_mut(&released.device) {
                *used -= released.size;
            }
        }
        trace!("physical_release({physical:?})");
        Ok(())
    }
}
