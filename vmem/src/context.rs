//! Devices and the contexts that group them.

use core::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, error};

use crate::{Backend, ContextHandle, DeviceHandle, VmemError};

bitflags! {
    /// Optional capabilities a device may have.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct DeviceAspects: u32 {
        /// The device can reserve virtual address ranges and map physical memory into them.
        const VIRTUAL_MEM = 1 << 0;
    }
}

/// A device as enumerated by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    handle: DeviceHandle,
    name: String,
    aspects: DeviceAspects,
}

impl Device {
    /// Creates a device description. Backends call this while enumerating.
    pub fn new(handle: DeviceHandle, name: impl Into<String>, aspects: DeviceAspects) -> Self {
        Self {
            handle,
            name: name.into(),
            aspects,
        }
    }

    /// The backend handle of the device.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// The human readable name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The capabilities of the device.
    pub fn aspects(&self) -> DeviceAspects {
        self.aspects
    }

    /// Returns true if the device has every capability in `aspects`.
    pub fn has(&self, aspects: DeviceAspects) -> bool {
        self.aspects.contains(aspects)
    }

    /// Fails with [`VmemError::UnsupportedFeature`] unless the device supports virtual memory.
    pub(crate) fn require_virtual_mem(&self) -> Result<(), VmemError> {
        if self.has(DeviceAspects::VIRTUAL_MEM) {
            Ok(())
        } else {
            Err(VmemError::UnsupportedFeature {
                device: self.name.clone(),
            })
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.handle.0)
    }
}

struct ContextInner {
    handle: ContextHandle,
    devices: Vec<Device>,
    backend: Arc<dyn Backend>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        debug!("Releasing context {:?}", self.handle);
        if let Err(e) = self.backend.context_release(self.handle) {
            error!("Failed to release context {:?}: {}", self.handle, e);
        }
    }
}

/// A set of devices sharing one backend context.
///
/// Cloning a context is cheap and the clones refer to the same backend context, which is released
/// once the last clone is dropped. Two contexts compare equal only if they are clones of each other.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a context spanning `devices` on `backend`.
    pub fn new(backend: Arc<dyn Backend>, devices: Vec<Device>) -> Result<Self, VmemError> {
        if devices.is_empty() {
            return Err(VmemError::InvalidArgument(
                "a context needs at least one device",
            ));
        }
        let handles: Vec<DeviceHandle> = devices.iter().map(Device::handle).collect();
        let handle = backend.context_create(&handles)?;
        debug!("Created context {:?} with {} device(s)", handle, devices.len());
        Ok(Self {
            inner: Arc::new(ContextInner {
                handle,
                devices,
                backend,
            }),
        })
    }

    /// Creates a context spanning every device `backend` enumerates.
    pub fn with_all_devices(backend: Arc<dyn Backend>) -> Result<Self, VmemError> {
        let devices = backend.devices()?;
        Self::new(backend, devices)
    }

    /// The backend handle of the context.
    pub fn handle(&self) -> ContextHandle {
        self.inner.handle
    }

    /// The devices in the context.
    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    /// The backend the context was created on.
    pub fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    /// Returns true if `device` is part of this context.
    pub fn contains(&self, device: &Device) -> bool {
        self.inner
            .devices
            .iter()
            .any(|d| d.handle() == device.handle())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.inner.handle)
            .field("devices", &self.inner.devices)
            .finish()
    }
}
