//! Memory granularity queries.
//!
//! Reservation sizes, mapping offsets and physical allocation sizes generally have to be multiples
//! of the minimum granularity of the device. The recommended granularity is what the device
//! performs best with.

use crate::{Context, Device, GranularityKind, VmemError};

/// Queries the `kind` granularity of `device` in `context`.
pub fn mem_granularity(
    device: &Device,
    context: &Context,
    kind: GranularityKind,
) -> Result<usize, VmemError> {
    device.require_virtual_mem()?;
    let granularity = context
        .backend()
        .granularity(context.handle(), device.handle(), kind)?;
    Ok(granularity)
}

/// Queries the minimum granularity of `device` in `context`.
pub fn minimum_mem_granularity(device: &Device, context: &Context) -> Result<usize, VmemError> {
    mem_granularity(device, context, GranularityKind::Minimum)
}

/// Queries the recommended granularity of `device` in `context`.
pub fn recommended_mem_granularity(
    device: &Device,
    context: &Context,
) -> Result<usize, VmemError> {
    mem_granularity(device, context, GranularityKind::Recommended)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_common::{MockBackend, MockOp, capable_device, incapable_device};

    #[test]
    fn queries_backend() {
        let backend = Arc::new(MockBackend::new());
        let device = capable_device(1);
        let ctx = Context::new(backend.clone(), vec![device.clone()]).unwrap();

        assert_eq!(minimum_mem_granularity(&device, &ctx), Ok(MockBackend::MINIMUM_GRANULARITY));
        assert_eq!(
            recommended_mem_granularity(&device, &ctx),
            Ok(MockBackend::RECOMMENDED_GRANULARITY)
        );
        assert_eq!(backend.call_count(MockOp::Granularity), 2);
    }

    #[test]
    fn incapable_device_is_rejected_before_backend() {
        let backend = Arc::new(MockBackend::new());
        let device = incapable_device(1);
        let ctx = Context::new(backend.clone(), vec![device.clone()]).unwrap();

        for kind in [GranularityKind::Minimum, GranularityKind::Recommended] {
            assert!(matches!(
                mem_granularity(&device, &ctx, kind),
                Err(VmemError::UnsupportedFeature { .. })
            ));
        }
        assert_eq!(backend.call_count(MockOp::Granularity), 0);
    }
}
