//! vsim - a simulated device for vmem
//!
//! [`SimulatedBackend`] implements [`vmem::Backend`] entirely in process memory, so reservations
//! can be exercised without a device driver. Its address space, granularity and devices come from
//! a [`SimConfig`].

pub mod backend;
pub mod config;
mod mapper;

pub use backend::{SimOp, SimulatedBackend};
pub use config::{ConfigError, DeviceConfig, SimConfig, default_config};
