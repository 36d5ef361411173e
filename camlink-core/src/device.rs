//! Device descriptors.
//!
//! A [`DeviceInfo`] is an immutable description of one discoverable device.
//! The only mutable bit is its liveness flag, cleared when the owning
//! factory reports the device removed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bus::{Guid, Participant};
use crate::mask::ProductLine;
use crate::protocol::DeviceAnnouncement;

/// Where a descriptor came from, and what is needed to open it.
#[derive(Debug, Clone)]
pub enum DeviceOrigin {
    /// A locally attached device reported by the hardware backend.
    Backend {
        /// Backend-unique identifier (e.g. a USB path).
        id: String,
        vendor_id: u16,
        product_id: u16,
    },
    /// A device discovered over the publish/subscribe bus.
    Remote(RemoteDeviceHandle),
    /// A device injected by the user through [`Context::add_device`](crate::Context::add_device).
    Software,
}

/// Everything needed to open a session with a discovered remote device.
#[derive(Clone)]
pub struct RemoteDeviceHandle {
    pub participant: Participant,
    /// Guid of the writer that announced the device.
    pub guid: Guid,
    pub announcement: DeviceAnnouncement,
}

impl fmt::Debug for RemoteDeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDeviceHandle")
            .field("guid", &self.guid)
            .field("topic_root", &self.announcement.topic_root)
            .finish()
    }
}

/// Immutable descriptor of one discoverable device.
#[derive(Debug)]
pub struct DeviceInfo {
    address: String,
    product_line: ProductLine,
    origin: DeviceOrigin,
    alive: AtomicBool,
}

/// Descriptors are shared between factories, the context and callers.
pub type DeviceRef = Arc<DeviceInfo>;

impl DeviceInfo {
    pub fn new(address: impl Into<String>, product_line: ProductLine, origin: DeviceOrigin) -> Self {
        Self {
            address: address.into(),
            product_line,
            origin,
            alive: AtomicBool::new(true),
        }
    }

    /// A software-only device, as injected by users.
    pub fn software(address: impl Into<String>) -> DeviceRef {
        Arc::new(Self::new(address, ProductLine::SW_ONLY, DeviceOrigin::Software))
    }

    /// Transport-qualified unique address.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn product_line(&self) -> ProductLine {
        self.product_line
    }

    pub fn origin(&self) -> &DeviceOrigin {
        &self.origin
    }

    /// Whether this device only exists in software.
    pub fn is_software_only(&self) -> bool {
        !matches!(self.origin, DeviceOrigin::Backend { .. })
    }

    /// The remote handle, if the device was discovered on the bus.
    pub fn remote(&self) -> Option<&RemoteDeviceHandle> {
        match &self.origin {
            DeviceOrigin::Remote(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear liveness. Called by the owning factory on removal.
    pub fn mark_gone(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// `(removed, added)` notification presented to device-change subscribers.
pub type DevicesChangedCallback = Arc<dyn Fn(&[DeviceRef], &[DeviceRef]) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_device_defaults() {
        let dev = DeviceInfo::software("sw/1");
        assert_eq!(dev.address(), "sw/1");
        assert!(dev.is_alive());
        assert!(dev.is_software_only());
        assert!(dev.remote().is_none());
        assert_eq!(dev.to_string(), "sw/1");
    }

    #[test]
    fn liveness_flips_once() {
        let dev = DeviceInfo::new(
            "usb/1-2",
            ProductLine::STEREO,
            DeviceOrigin::Backend {
                id: "1-2".into(),
                vendor_id: 0x1d6b,
                product_id: 0x0104,
            },
        );
        assert!(!dev.is_software_only());
        dev.mark_gone();
        assert!(!dev.is_alive());
    }
}
