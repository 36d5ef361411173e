//! Device factories: per-transport producers of device descriptors.

mod backend;

pub use backend::{
    BackendDevice, BackendDeviceFactory, DeviceGroup, DeviceWatcher, SimulatedBackend, WatcherCallback,
};

use crate::device::DeviceRef;
use crate::mask::ProductLine;

/// Produces the currently visible devices for one transport.
///
/// Factories also report arrivals and removals through the
/// [`DevicesChangedCallback`](crate::device::DevicesChangedCallback) they were
/// built with. A factory never invokes that callback concurrently with
/// itself, and never lists the same descriptor as both removed and added.
pub trait DeviceFactory: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Devices visible right now that pass `mask`.
    fn query_devices(&self, mask: ProductLine) -> Vec<DeviceRef>;
}
