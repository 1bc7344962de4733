//! vaspace - device virtual address space reservations
//!
//! Re-exports [`vmem`] together with the simulated device from [`vsim`], and wires the two up.

use std::sync::Arc;

use thiserror::Error;
pub use vmem::*;
pub use vsim::{self, ConfigError, SimConfig, SimOp, SimulatedBackend};

/// Errors raised while setting up a simulated device.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The simulator configuration is unusable.
    #[error("Invalid simulator configuration: {0}")]
    Config(#[from] ConfigError),
    /// The context could not be created on the simulated device.
    #[error("Unable to create a context: {0}")]
    Context(#[from] VmemError),
}

/// Creates a [`SimulatedBackend`] for `config` and a context spanning every device it simulates.
pub fn simulated_context(
    config: SimConfig,
) -> Result<(Arc<SimulatedBackend>, Context), SetupError> {
    let backend = Arc::new(SimulatedBackend::new(config)?);
    let context = Context::with_all_devices(backend.clone())?;
    Ok((backend, context))
}

/// The first device of `context` that can map virtual memory.
pub fn virtual_mem_device(context: &Context) -> Option<&Device> {
    context
        .devices()
        .iter()
        .find(|device| device.has(DeviceAspects::VIRTUAL_MEM))
}
