//! Scoped device acquisition for the transformer

use tracing::{debug, warn};

use crate::error::Result;
use crate::stepper::FramePackModel;

/// Host-side memory management hooks
pub trait DeviceManager {
    /// Evict every other model currently resident on the compute device
    fn unload_all_models(&mut self);
    /// Release cached allocator blocks
    fn soft_empty_cache(&mut self);
}

/// Device manager for hosts without a separate compute device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDeviceManager;

impl DeviceManager for CpuDeviceManager {
    fn unload_all_models(&mut self) {}
    fn soft_empty_cache(&mut self) {}
}

/// The transformer held on the compute device for the duration of a run.
///
/// Dropping the lease offloads the model and empties the cache, whether the
/// run finished, failed or was cancelled.
pub struct DeviceLease<'s, M: FramePackModel + ?Sized, D: DeviceManager + ?Sized> {
    model: &'s mut M,
    devices: &'s mut D,
}

impl<'s, M: FramePackModel + ?Sized, D: DeviceManager + ?Sized> DeviceLease<'s, M, D> {
    /// Clear the device and move the model onto it, keeping
    /// `preserved_memory_gb` free
    pub fn acquire(model: &'s mut M, devices: &'s mut D, preserved_memory_gb: f64) -> Result<Self> {
        devices.unload_all_models();
        devices.soft_empty_cache();
        if let Err(err) = model.load_to_device(preserved_memory_gb) {
            if let Err(offload_err) = model.offload() {
                warn!(error = %offload_err, "Failed to offload model after a failed load");
            }
            devices.soft_empty_cache();
            return Err(err);
        }
        debug!(preserved_memory_gb, "Model moved to compute device");
        Ok(Self { model, devices })
    }

    pub fn model(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: FramePackModel + ?Sized, D: DeviceManager + ?Sized> Drop for DeviceLease<'_, M, D> {
    fn drop(&mut self) {
        if let Err(err) = self.model.offload() {
            warn!(error = %err, "Failed to offload model");
        }
        self.devices.soft_empty_cache();
        debug!("Device lease released");
    }
}
