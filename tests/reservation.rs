use std::{sync::Arc, thread};

use vaspace::{
    minimum_mem_granularity, recommended_mem_granularity, simulated_context, virtual_mem_device,
    vsim::DeviceConfig, AccessMode, BackendError, Context, Device, DeviceHandle, PhysicalMemory,
    SetupError, SimConfig, SimOp, SimulatedBackend, VirtAddr, VirtualAddressReservation,
    VmemError,
};

const PAGE: usize = 0x1000;

struct Sim {
    backend: Arc<SimulatedBackend>,
    context: Context,
}

impl Sim {
    fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    fn with_config(config: SimConfig) -> Self {
        #[cfg(unix)]
        let _ = env_logger::builder().is_test(true).try_init();
        let (backend, context) = simulated_context(config).unwrap();
        Self { backend, context }
    }

    fn device(&self) -> &Device {
        virtual_mem_device(&self.context).unwrap()
    }

    fn reserve(&self, num_bytes: usize) -> VirtualAddressReservation {
        VirtualAddressReservation::new(None, num_bytes, &self.context).unwrap()
    }

    fn physical(&self, num_bytes: usize) -> PhysicalMemory {
        PhysicalMemory::new(self.device(), &self.context, num_bytes).unwrap()
    }
}

#[track_caller]
fn assert_offsets(reservation: &VirtualAddressReservation, offsets: &[usize]) {
    let mapped: Vec<usize> = reservation
        .mapped_ranges()
        .iter()
        .map(|m| m.start().offset_from(reservation.start()).unwrap())
        .collect();
    assert_eq!(mapped, offsets);
}

#[test]
fn reserve_has_requested_size() {
    let sim = Sim::new();
    for pages in [1, 2, 7, 16, 255] {
        let reservation = sim.reserve(pages * PAGE);
        assert_eq!(reservation.size(), pages * PAGE);
        assert!(!reservation.is_mapped());
    }
    let hint = VirtAddr::new(0x1000_0100_0000);
    let reservation = VirtualAddressReservation::new(Some(hint), 4 * PAGE, &sim.context).unwrap();
    assert_eq!(reservation.start(), hint);
    assert_eq!(reservation.size(), 4 * PAGE);
    assert_eq!(reservation.context(), &sim.context);
}

#[test]
fn reserve_surfaces_backend_errors() {
    let sim = Sim::new();
    assert!(matches!(
        VirtualAddressReservation::new(None, PAGE / 2, &sim.context),
        Err(VmemError::Backend(BackendError::Misaligned { .. }))
    ));
    sim.backend
        .fail_next(SimOp::Reserve, BackendError::OutOfAddressSpace { requested: PAGE });
    assert_eq!(
        VirtualAddressReservation::new(None, PAGE, &sim.context).unwrap_err(),
        VmemError::Backend(BackendError::OutOfAddressSpace { requested: PAGE })
    );
    assert_eq!(sim.backend.reservation_count(), 0);
}

#[test]
fn unmap_at_removes_entry_once() {
    let sim = Sim::new();
    let reservation = sim.reserve(4 * PAGE);
    let physical = sim.physical(PAGE);

    reservation.map(2 * PAGE, PAGE, &physical, 0, AccessMode::ReadWrite).unwrap();
    assert_offsets(&reservation, &[2 * PAGE]);
    reservation.unmap_at(2 * PAGE).unwrap();
    assert_offsets(&reservation, &[]);
    assert!(matches!(
        reservation.unmap_at(2 * PAGE),
        Err(VmemError::InvalidArgument(_))
    ));
    assert_eq!(sim.backend.mapping_count(), 0);
}

#[test]
fn unmap_physical_removes_one_of_several() {
    let sim = Sim::new();
    let reservation = sim.reserve(4 * PAGE);
    let shared = sim.physical(PAGE);
    let other = sim.physical(PAGE);

    reservation.map_range(0, PAGE, &shared, 0).unwrap();
    reservation.map_range(PAGE, PAGE, &other, 0).unwrap();
    reservation.map_range(3 * PAGE, PAGE, &shared, 0).unwrap();

    reservation.unmap_physical(&shared).unwrap();
    assert_offsets(&reservation, &[PAGE, 3 * PAGE]);
    reservation.unmap_physical(&shared).unwrap();
    assert_offsets(&reservation, &[PAGE]);
    assert!(matches!(
        reservation.unmap_physical(&shared),
        Err(VmemError::InvalidArgument(_))
    ));
}

#[test]
fn map_outside_reservation_fails() {
    let sim = Sim::new();
    let reservation = sim.reserve(2 * PAGE);
    let physical = sim.physical(4 * PAGE);
    reservation.map(0, PAGE, &physical, 0, AccessMode::Read).unwrap();

    for (offset, size) in [(PAGE, 2 * PAGE), (2 * PAGE, PAGE), (0, 3 * PAGE), (usize::MAX, PAGE)] {
        assert!(matches!(
            reservation.map(offset, size, &physical, 0, AccessMode::Read),
            Err(VmemError::InvalidRange(_))
        ));
    }
    assert!(matches!(
        reservation.map(PAGE, PAGE, &physical, 4 * PAGE, AccessMode::Read),
        Err(VmemError::InvalidRange(_))
    ));
    assert_offsets(&reservation, &[0]);
    assert_eq!(sim.backend.mapping_count(), 1);
}

#[test]
fn access_mode_set_before_map_sticks() {
    let sim = Sim::new();
    let reservation = sim.reserve(2 * PAGE);
    let physical = sim.physical(2 * PAGE);

    reservation.set_access_mode(AccessMode::ReadWrite).unwrap();
    reservation.map_range(0, PAGE, &physical, 0).unwrap();
    assert_eq!(reservation.access_mode(), Ok(AccessMode::ReadWrite));
    reservation.map(PAGE, PAGE, &physical, PAGE, AccessMode::ReadWrite).unwrap();
    assert_eq!(reservation.access_mode(), Ok(AccessMode::ReadWrite));
}

#[test]
fn read_then_read_write_then_unmap() {
    let sim = Sim::new();
    let reservation = sim.reserve(4096);
    let physical = sim.physical(4096);

    reservation.map(0, 4096, &physical, 0, AccessMode::Read).unwrap();
    assert_eq!(reservation.access_mode(), Ok(AccessMode::Read));
    reservation.set_access_mode(AccessMode::ReadWrite).unwrap();
    assert_eq!(reservation.access_mode(), Ok(AccessMode::ReadWrite));
    reservation.unmap_all().unwrap();
    assert_eq!(reservation.access_mode(), Err(VmemError::NoMapping));
}

#[test]
fn unmap_second_of_two() {
    let sim = Sim::new();
    let reservation = sim.reserve(8192);
    let first = sim.physical(4096);
    let second = sim.physical(4096);

    reservation.map_range(0, 4096, &first, 0).unwrap();
    reservation.map_range(4096, 4096, &second, 0).unwrap();
    reservation.unmap_at(4096).unwrap();

    let remaining = reservation.mapped_ranges();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].start(), reservation.start());
    assert_eq!(remaining[0].physical(), &first);
    assert_eq!(reservation.access_mode(), Ok(AccessMode::None));
}

#[test]
fn overlapping_map_is_rejected() {
    let sim = Sim::new();
    let reservation = sim.reserve(4 * PAGE);
    let physical = sim.physical(4 * PAGE);
    reservation.map_range(PAGE, 2 * PAGE, &physical, 0).unwrap();

    assert_eq!(
        reservation.map_range(2 * PAGE, 2 * PAGE, &physical, 0),
        Err(VmemError::AlreadyMapped {
            start: reservation.start() + 2 * PAGE,
            size: 2 * PAGE,
        })
    );
    assert_offsets(&reservation, &[PAGE]);
    assert_eq!(sim.backend.call_count(SimOp::Map), 1);
}

#[test]
fn differing_mode_is_rejected() {
    let sim = Sim::new();
    let reservation = sim.reserve(2 * PAGE);
    let physical = sim.physical(2 * PAGE);
    reservation.map(0, PAGE, &physical, 0, AccessMode::Read).unwrap();

    assert_eq!(
        reservation.map(PAGE, PAGE, &physical, PAGE, AccessMode::ReadWrite),
        Err(VmemError::AccessModeMismatch {
            requested: AccessMode::ReadWrite,
            current: AccessMode::Read,
        })
    );
    // Without an explicit mode the reservation's mode is used.
    reservation.map_range(PAGE, PAGE, &physical, PAGE).unwrap();
    assert_eq!(reservation.access_mode(), Ok(AccessMode::Read));
}

#[test]
fn failed_backend_map_changes_nothing() {
    let sim = Sim::new();
    let reservation = sim.reserve(2 * PAGE);
    let physical = sim.physical(2 * PAGE);
    reservation.map_range(0, PAGE, &physical, 0).unwrap();

    sim.backend.fail_next(SimOp::Map, BackendError::Driver(-12));
    assert_eq!(
        reservation.map_range(PAGE, PAGE, &physical, PAGE),
        Err(VmemError::Backend(BackendError::Driver(-12)))
    );
    assert_offsets(&reservation, &[0]);
    assert_eq!(sim.backend.mapping_count(), 1);
}

#[test]
fn failed_unmap_all_keeps_failing_and_later_ranges() {
    let sim = Sim::new();
    let reservation = sim.reserve(3 * PAGE);
    let physical = sim.physical(3 * PAGE);
    for page in 0..3 {
        reservation
            .map_range(page * PAGE, PAGE, &physical, page * PAGE)
            .unwrap();
    }

    sim.backend.fail_next(SimOp::Unmap, BackendError::Driver(-1));
    assert_eq!(
        reservation.unmap_all(),
        Err(VmemError::Backend(BackendError::Driver(-1)))
    );
    assert_offsets(&reservation, &[0, PAGE, 2 * PAGE]);
    assert_eq!(sim.backend.mapping_count(), 3);

    // Nothing is left in a half state, so a retry goes through.
    reservation.unmap_all().unwrap();
    assert_offsets(&reservation, &[]);
    assert_eq!(sim.backend.mapping_count(), 0);
}

#[test]
fn drop_releases_everything() {
    let sim = Sim::new();
    {
        let reservation = sim.reserve(4 * PAGE);
        let physical = sim.physical(2 * PAGE);
        reservation.map_range(0, 2 * PAGE, &physical, 0).unwrap();
        reservation.map_range(2 * PAGE, 2 * PAGE, &physical, 0).unwrap();
        assert_eq!(sim.backend.mapping_count(), 2);
    }
    assert_eq!(sim.backend.mapping_count(), 0);
    assert_eq!(sim.backend.reservation_count(), 0);
    assert_eq!(sim.backend.physical_count(), 0);
    assert_eq!(
        sim.backend.free_address_space(),
        SimConfig::default().address_space.size
    );
}

#[test]
fn drop_is_best_effort() {
    let sim = Sim::new();
    {
        let reservation = sim.reserve(2 * PAGE);
        let physical = sim.physical(2 * PAGE);
        reservation.map_range(0, PAGE, &physical, 0).unwrap();
        reservation.map_range(PAGE, PAGE, &physical, PAGE).unwrap();
        sim.backend.fail_next(SimOp::Unmap, BackendError::Driver(-1));
    }
    // The first unmap failed, the second still went through. The range could not be freed while
    // something was mapped, and neither could the physical memory.
    assert_eq!(sim.backend.call_count(SimOp::Unmap), 2);
    assert_eq!(sim.backend.mapping_count(), 1);
    assert_eq!(sim.backend.reservation_count(), 1);
    assert_eq!(sim.backend.physical_count(), 1);
}

#[test]
fn incapable_devices_are_rejected() {
    let mut config = SimConfig::default();
    config.devices.push(DeviceConfig::new("host", false, 16 * PAGE));
    let sim = Sim::with_config(config);
    let host = sim
        .context
        .devices()
        .iter()
        .find(|d| d.handle() == DeviceHandle(1))
        .unwrap();

    assert!(matches!(
        minimum_mem_granularity(host, &sim.context),
        Err(VmemError::UnsupportedFeature { .. })
    ));
    assert!(matches!(
        recommended_mem_granularity(host, &sim.context),
        Err(VmemError::UnsupportedFeature { .. })
    ));
    assert!(matches!(
        VirtualAddressReservation::new(None, PAGE, &sim.context),
        Err(VmemError::UnsupportedFeature { .. })
    ));
    assert_eq!(sim.backend.call_count(SimOp::Granularity), 0);
    assert_eq!(sim.backend.call_count(SimOp::Reserve), 0);

    assert_eq!(minimum_mem_granularity(sim.device(), &sim.context), Ok(PAGE));
    assert_eq!(
        recommended_mem_granularity(sim.device(), &sim.context),
        Ok(SimConfig::default().recommended_granularity)
    );
}

#[test]
fn physical_from_other_context_is_rejected() {
    let sim = Sim::new();
    let other = Sim::new();
    let reservation = sim.reserve(PAGE);
    let foreign = other.physical(PAGE);
    assert!(matches!(
        reservation.map_range(0, PAGE, &foreign, 0),
        Err(VmemError::InvalidArgument(_))
    ));
    assert_eq!(sim.backend.call_count(SimOp::Map), 0);
}

#[test]
fn reservations_are_shared_between_threads() {
    let sim = Sim::new();
    let reservation = sim.reserve(32 * PAGE);
    let physical = sim.physical(PAGE);

    thread::scope(|s| {
        for page in 0..32 {
            let reservation = &reservation;
            let physical = &physical;
            s.spawn(move || {
                reservation.map_range(page * PAGE, PAGE, physical, 0).unwrap();
            });
        }
    });
    assert_eq!(reservation.mapped_ranges().len(), 32);
    assert_eq!(sim.backend.mapping_count(), 32);

    thread::scope(|s| {
        for page in 0..32 {
            let reservation = &reservation;
            s.spawn(move || reservation.unmap_at(page * PAGE).unwrap());
        }
    });
    assert!(!reservation.is_mapped());
    assert_eq!(sim.backend.mapping_count(), 0);
}

#[test]
fn unusable_config_is_reported() {
    let mut config = SimConfig::default();
    config.minimum_granularity = 0;
    assert!(matches!(simulated_context(config), Err(SetupError::Config(_))));
}
