use std::{env::args, process::exit};

use log::{error, info};
use vaspace::{
    minimum_mem_granularity, simulated_context, virtual_mem_device, vsim, AccessMode, Context,
    PhysicalMemory, VirtualAddressReservation, VmemError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let scenario = args().nth(1).unwrap_or_else(|| "all".to_string());
    let scenarios = match scenario.as_str() {
        "access" | "split" => vec![scenario.as_str()],
        "all" => vec!["access", "split"],
        other => {
            eprintln!("Unknown scenario {other}, expected one of: access, split, all");
            exit(2);
        }
    };

    let (backend, context) = match simulated_context(vsim::default_config().clone()) {
        Ok(sim) => sim,
        Err(e) => {
            error!("Unable to set up the simulated device: {e}");
            exit(1);
        }
    };

    let mut failed = false;
    for name in scenarios {
        info!("Running scenario {name}");
        let result = match name {
            "access" => access(&context),
            _ => split(&context),
        };
        match result {
            Ok(()) => info!("Scenario {name} passed"),
            Err(e) => {
                error!("Scenario {name} failed: {e}");
                failed = true;
            }
        }
    }
    info!(
        "{} reservations, {} mappings and {} physical allocations left",
        backend.reservation_count(),
        backend.mapping_count(),
        backend.physical_count()
    );
    if failed {
        exit(1);
    }
}

/// Reserve one granule, map it read only, switch it to read write, then unmap everything.
fn access(context: &Context) -> Result<(), VmemError> {
    let device =
        virtual_mem_device(context).ok_or(VmemError::InvalidArgument("no capable device"))?;
    let granule = minimum_mem_granularity(device, context)?;

    let reservation = VirtualAddressReservation::new(None, granule, context)?;
    let physical = PhysicalMemory::new(device, context, granule)?;
    reservation.map(0, granule, &physical, 0, AccessMode::Read)?;
    info!("Access mode after map: {}", reservation.access_mode()?);

    reservation.set_access_mode(AccessMode::ReadWrite)?;
    info!("Access mode after change: {}", reservation.access_mode()?);

    reservation.unmap_all()?;
    match reservation.access_mode() {
        Err(VmemError::NoMapping) => info!("Nothing mapped any more"),
        other => {
            error!("Expected no mapping, got {other:?}");
            return Err(VmemError::InvalidArgument("reservation still reports a mapping"));
        }
    }
    Ok(())
}

/// Map two granules backed by separate physical allocations, then unmap only the second one.
fn split(context: &Context) -> Result<(), VmemError> {
    let device =
        virtual_mem_device(context).ok_or(VmemError::InvalidArgument("no capable device"))?;
    let granule = minimum_mem_granularity(device, context)?;

    let reservation = VirtualAddressReservation::new(None, 2 * granule, context)?;
    let first = PhysicalMemory::new(device, context, granule)?;
    let second = PhysicalMemory::new(device, context, granule)?;
    reservation.map_range(0, granule, &first, 0)?;
    reservation.map_range(granule, granule, &second, 0)?;

    reservation.unmap_at(granule)?;
    for mapped in reservation.mapped_ranges() {
        info!("Still mapped: {} backed by {:?}", mapped.range(), mapped.physical().id());
    }
    info!("Access mode of the remaining range: {}", reservation.access_mode()?);
    Ok(())
}
