//! Local hardware backend factory.
//!
//! The platform backend itself (USB enumeration, hot-plug monitoring) is an
//! external collaborator behind [`DeviceWatcher`]. The factory turns the
//! watcher's successive device groups into descriptor diffs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info};

use super::DeviceFactory;
use crate::device::{DeviceInfo, DeviceOrigin, DeviceRef, DevicesChangedCallback};
use crate::mask::ProductLine;

/// One device as the platform backend sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendDevice {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_line: ProductLine,
}

impl BackendDevice {
    pub fn address(&self) -> String {
        format!("usb:{}", self.id)
    }
}

/// Snapshot of all backend devices.
pub type DeviceGroup = Vec<BackendDevice>;

/// Invoked with `(previous, current)` device groups.
pub type WatcherCallback = Box<dyn Fn(&DeviceGroup, &DeviceGroup) + Send + Sync>;

/// Platform hot-plug monitor.
pub trait DeviceWatcher: Send + Sync {
    /// Begin reporting changes. Callbacks are serialized.
    fn start(&self, callback: WatcherCallback);
    /// Stop reporting. No callback runs after this returns. Idempotent.
    fn stop(&self);
    /// Current device group.
    fn devices(&self) -> DeviceGroup;
    fn is_stopped(&self) -> bool;
}

// ── SimulatedBackend ─────────────────────────────────────────────

/// In-memory backend whose devices are plugged and unplugged by hand.
#[derive(Default)]
pub struct SimulatedBackend {
    devices: Mutex<DeviceGroup>,
    callback: Mutex<Option<Arc<WatcherCallback>>>,
    /// Held while a change is reported. Reentrant so a callback may plug,
    /// unplug or stop on the same thread.
    reporting: ReentrantMutex<()>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: DeviceGroup) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Self::default()
        }
    }

    /// Attach a device; reports the change if started.
    pub fn plug(&self, device: BackendDevice) {
        self.update(|group| {
            if group.iter().any(|d| d.id == device.id) {
                return false;
            }
            group.push(device);
            true
        });
    }

    /// Detach a device by id. Returns whether it was present.
    pub fn unplug(&self, id: &str) -> bool {
        self.update(|group| {
            let before = group.len();
            group.retain(|d| d.id != id);
            group.len() != before
        })
    }

    fn update(&self, change: impl FnOnce(&mut DeviceGroup) -> bool) -> bool {
        let _reporting = self.reporting.lock();
        let (old, new) = {
            let mut devices = self.devices.lock();
            let old = devices.clone();
            if !change(&mut devices) {
                return false;
            }
            (old, devices.clone())
        };
        // Called with no data lock held.
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb(&old, &new);
        }
        true
    }
}

impl DeviceWatcher for SimulatedBackend {
    fn start(&self, callback: WatcherCallback) {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    fn stop(&self) {
        let _reporting = self.reporting.lock();
        self.callback.lock().take();
    }

    fn devices(&self) -> DeviceGroup {
        self.devices.lock().clone()
    }

    fn is_stopped(&self) -> bool {
        self.callback.lock().is_none()
    }
}

// ── BackendDeviceFactory ─────────────────────────────────────────

fn descriptor(device: &BackendDevice) -> DeviceRef {
    Arc::new(DeviceInfo::new(
        device.address(),
        device.product_line,
        DeviceOrigin::Backend {
            id: device.id.clone(),
            vendor_id: device.vendor_id,
            product_id: device.product_id,
        },
    ))
}

/// Factory for locally attached devices.
pub struct BackendDeviceFactory {
    watcher: Arc<dyn DeviceWatcher>,
    known: Arc<Mutex<HashMap<String, DeviceRef>>>,
}

impl BackendDeviceFactory {
    pub fn new(watcher: Arc<dyn DeviceWatcher>, callback: DevicesChangedCallback) -> Self {
        let known: HashMap<String, DeviceRef> = watcher
            .devices()
            .iter()
            .map(|d| (d.id.clone(), descriptor(d)))
            .collect();
        let known = Arc::new(Mutex::new(known));

        let tracked = known.clone();
        watcher.start(Box::new(move |old: &DeviceGroup, new: &DeviceGroup| {
            let old_ids: HashSet<&str> = old.iter().map(|d| d.id.as_str()).collect();
            let new_ids: HashSet<&str> = new.iter().map(|d| d.id.as_str()).collect();

            let (removed, added) = {
                let mut known = tracked.lock();
                let removed: Vec<DeviceRef> = old
                    .iter()
                    .filter(|d| !new_ids.contains(d.id.as_str()))
                    .filter_map(|d| known.remove(&d.id))
                    .inspect(|dev| dev.mark_gone())
                    .collect();
                let added: Vec<DeviceRef> = new
                    .iter()
                    .filter(|d| !old_ids.contains(d.id.as_str()))
                    .map(|d| {
                        let dev = descriptor(d);
                        known.insert(d.id.clone(), dev.clone());
                        dev
                    })
                    .collect();
                (removed, added)
            };

            if removed.is_empty() && added.is_empty() {
                return;
            }
            info!(
                removed = removed.len(),
                added = added.len(),
                "backend devices changed"
            );
            callback(&removed, &added);
        }));

        Self { watcher, known }
    }
}

impl DeviceFactory for BackendDeviceFactory {
    fn name(&self) -> &str {
        "backend"
    }

    fn query_devices(&self, mask: ProductLine) -> Vec<DeviceRef> {
        let known = self.known.lock();
        let mut list: Vec<DeviceRef> = known
            .values()
            .filter(|dev| mask.admits(dev.product_line(), false))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.address().cmp(b.address()));
        debug!("backend: {} of {} devices match {mask:?}", list.len(), known.len());
        list
    }
}

impl Drop for BackendDeviceFactory {
    fn drop(&mut self) {
        self.watcher.stop();
    }
}
