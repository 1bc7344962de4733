//! A recording backend for unit tests.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use spin::Mutex;

use crate::{
    Backend, BackendError, ContextHandle, Device, DeviceAspects, DeviceHandle, GranularityKind,
    PhysicalHandle, VirtAddr, VirtualAccessFlags,
};

/// Installs a test logger. Safe to call from every test.
pub fn init_logging() {
    #[cfg(unix)]
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn capable_device(id: u64) -> Device {
    Device::new(DeviceHandle(id), format!("mock{id}"), DeviceAspects::VIRTUAL_MEM)
}

pub fn incapable_device(id: u64) -> Device {
    Device::new(DeviceHandle(id), format!("mock{id}"), DeviceAspects::empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Devices,
    ContextCreate,
    ContextRelease,
    Reserve,
    Free,
    Map,
    Unmap,
    SetAccess,
    GetAccess,
    Granularity,
    PhysicalCreate,
    PhysicalRelease,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    next_address: usize,
    calls: HashMap<MockOp, usize>,
    /// Op, successful calls to let through first, error.
    faults: Vec<(MockOp, usize, BackendError)>,
    access: HashMap<VirtAddr, VirtualAccessFlags>,
    map_delay: Option<Duration>,
}

/// Accepts almost everything, remembers access flags per mapped start, and fails on request.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
    map_started: AtomicBool,
}

impl MockBackend {
    pub const MINIMUM_GRANULARITY: usize = 0x1000;
    pub const RECOMMENDED_GRANULARITY: usize = 0x10000;
    pub const FIRST_ADDRESS: usize = 0x10_0000_0000;

    pub fn new() -> Self {
        init_logging();
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                next_address: Self::FIRST_ADDRESS,
                calls: HashMap::new(),
                faults: Vec::new(),
                access: HashMap::new(),
                map_delay: None,
            }),
            map_started: AtomicBool::new(false),
        }
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: MockOp, error: BackendError) {
        self.fail_after(op, 0, error);
    }

    /// Lets `skip` calls of `op` succeed, then fails the one after with `error`.
    pub fn fail_after(&self, op: MockOp, skip: usize, error: BackendError) {
        self.state.lock().faults.push((op, skip, error));
    }

    /// Makes every map call take at least `delay`.
    pub fn delay_maps(&self, delay: Duration) {
        self.state.lock().map_delay = Some(delay);
    }

    /// Returns true once a map call has been entered.
    pub fn map_started(&self) -> bool {
        self.map_started.load(Ordering::Acquire)
    }

    pub fn flags_at(&self, start: VirtAddr) -> Option<VirtualAccessFlags> {
        self.state.lock().access.get(&start).copied()
    }

    fn record(&self, op: MockOp) -> Result<spin::MutexGuard<'_, MockState>, BackendError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(index) = state.faults.iter().position(|(o, _, _)| *o == op) {
            if state.faults[index].1 > 0 {
                state.faults[index].1 -= 1;
            } else {
                let (_, _, error) = state.faults.remove(index);
                return Err(error);
            }
        }
        Ok(state)
    }

    fn next_handle(state: &mut MockState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

impl Backend for MockBackend {
    fn devices(&self) -> Result<Vec<Device>, BackendError> {
        self.record(MockOp::Devices)?;
        Ok(vec![capable_device(1), capable_device(2)])
    }

    fn context_create(&self, _devices: &[DeviceHandle]) -> Result<ContextHandle, BackendError> {
        let mut state = self.record(MockOp::ContextCreate)?;
        Ok(ContextHandle(Self::next_handle(&mut state)))
    }

    fn context_release(&self, _context: ContextHandle) -> Result<(), BackendError> {
        self.record(MockOp::ContextRelease).map(drop)
    }

    fn reserve(
        &self,
        _context: ContextHandle,
        requested_start: Option<VirtAddr>,
        num_bytes: usize,
    ) -> Result<VirtAddr, BackendError> {
        let mut state = self.record(MockOp::Reserve)?;
        if let Some(start) = requested_start {
            return Ok(start);
        }
        let start = VirtAddr::new(state.next_address);
        state.next_address += num_bytes;
        Ok(start)
    }

    fn free(
        &self,
        _context: ContextHandle,
        _start: VirtAddr,
        _num_bytes: usize,
    ) -> Result<(), BackendError> {
        self.record(MockOp::Free).map(drop)
    }

    fn map(
        &self,
        _context: ContextHandle,
        start: VirtAddr,
        _size: usize,
        _physical: PhysicalHandle,
        _physical_offset: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError> {
        self.map_started.store(true, Ordering::Release);
        let delay = self.state.lock().map_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut state = self.record(MockOp::Map)?;
        state.access.insert(start, flags);
        Ok(())
    }

    fn unmap(&self, _context: ContextHandle, start: VirtAddr, size: usize) -> Result<(), BackendError> {
        let mut state = self.record(MockOp::Unmap)?;
        state
            .access
            .remove(&start)
            .map(drop)
            .ok_or(BackendError::NotMapped { start, size })
    }

    fn set_access(
        &self,
        _context: ContextHandle,
        start: VirtAddr,
        size: usize,
        flags: VirtualAccessFlags,
    ) -> Result<(), BackendError> {
        let mut state = self.record(MockOp::SetAccess)?;
        match state.access.get_mut(&start) {
            Some(current) => {
                *current = flags;
                Ok(())
            }
            None => Err(BackendError::NotMapped { start, size }),
        }
    }

    fn get_access(
        &self,
        _context: ContextHandle,
        start: VirtAddr,
        size: usize,
    ) -> Result<VirtualAccessFlags, BackendError> {
        let state = self.record(MockOp::GetAccess)?;
        state
            .access
            .get(&start)
            .copied()
            .ok_or(BackendError::NotMapped { start, size })
    }

    fn granularity(
        &self,
        _context: ContextHandle,
        _device: DeviceHandle,
        kind: GranularityKind,
    ) -> Result<usize, BackendError> {
        self.record(MockOp::Granularity)?;
        Ok(match kind {
            GranularityKind::Minimum => Self::MINIMUM_GRANULARITY,
            GranularityKind::Recommended => Self::RECOMMENDED_GRANULARITY,
        })
    }

    fn physical_create(
        &self,
        _context: ContextHandle,
        _device: DeviceHandle,
        _num_bytes: usize,
    ) -> Result<PhysicalHandle, BackendError> {
        let mut state = self.record(MockOp::PhysicalCreate)?;
        Ok(PhysicalHandle(Self::next_handle(&mut state)))
    }

    fn physical_release(
        &self,
        _context: ContextHandle,
        _physical: PhysicalHandle,
    ) -> Result<(), BackendError> {
        self.record(MockOp::PhysicalRelease).map(drop)
    }
}
