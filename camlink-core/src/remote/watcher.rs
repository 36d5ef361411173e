//! Host-side discovery: announcements on the bus become device descriptors.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Guid, Participant, Qos, ReaderEvent, TopicReader};
use crate::device::{DeviceInfo, DeviceOrigin, DeviceRef, DevicesChangedCallback, RemoteDeviceHandle};
use crate::error::{CamlinkError, Result};
use crate::factory::DeviceFactory;
use crate::mask::ProductLine;
use crate::protocol::{DEVICE_INFO_TOPIC, DeviceAnnouncement};
use crate::task::Worker;

/// Address of a bus device: `bus.<domain>/<topic_root>`.
pub fn device_address(domain: u32, topic_root: &str) -> String {
    format!("bus.{domain}/{topic_root}")
}

type Known = Arc<Mutex<BTreeMap<Guid, DeviceRef>>>;

/// Watches `camlink/device-info` and tracks announced devices.
///
/// A device is added on its writer's first announcement and removed when
/// that writer goes away. Callbacks run under `gate`, which `stop` also
/// takes, so none runs after `stop` returns.
pub struct BusDeviceWatcher {
    participant: Participant,
    known: Known,
    gate: Arc<Mutex<bool>>,
    worker: Mutex<Option<Worker>>,
}

impl BusDeviceWatcher {
    /// Start watching. Needs a Tokio runtime.
    pub fn start(participant: Participant, callback: DevicesChangedCallback) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("bus watcher needs a runtime: {e}")))?;

        let reader = participant.create_reader(DEVICE_INFO_TOPIC, Qos::Reliable);
        let known: Known = Arc::new(Mutex::new(BTreeMap::new()));
        let gate = Arc::new(Mutex::new(true));

        let worker = {
            let participant = participant.clone();
            let known = known.clone();
            let gate = gate.clone();
            Worker::spawn("bus-device-watcher", move |token| {
                watch(participant, reader, known, gate, callback, token)
            })
        };

        Ok(Self {
            participant,
            known,
            gate,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Devices currently announced.
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.known.lock().values().cloned().collect()
    }

    pub fn is_stopped(&self) -> bool {
        !*self.gate.lock()
    }

    /// Stop reporting. Waits for a callback in progress. Idempotent.
    pub fn stop(&self) {
        *self.gate.lock() = false;
        // Dropping the worker cancels and aborts the task.
        self.worker.lock().take();
    }
}

impl Drop for BusDeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch(
    participant: Participant,
    mut reader: TopicReader,
    known: Known,
    gate: Arc<Mutex<bool>>,
    callback: DevicesChangedCallback,
    token: CancellationToken,
) {
    let domain = participant.domain_id();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = reader.next_event() => event,
        };
        let Some(event) = event else { break };

        let running = gate.lock();
        if !*running {
            break;
        }
        match event {
            ReaderEvent::Data(sample) => {
                let writer = sample.info.writer;
                if known.lock().contains_key(&writer) {
                    continue;
                }
                let announcement: DeviceAnnouncement = match sample.decode() {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("ignoring malformed device announcement from {writer}: {e}");
                        continue;
                    }
                };
                let address = device_address(domain, &announcement.topic_root);
                info!(name = %announcement.name, serial = %announcement.serial, "discovered {address}");
                let dev = Arc::new(DeviceInfo::new(
                    address,
                    announcement.product_line,
                    DeviceOrigin::Remote(RemoteDeviceHandle {
                        participant: participant.clone(),
                        guid: writer,
                        announcement,
                    }),
                ));
                known.lock().insert(writer, dev.clone());
                callback(&[], &[dev]);
            }
            ReaderEvent::WriterGone(writer) => {
                let Some(dev) = known.lock().remove(&writer) else {
                    continue;
                };
                dev.mark_gone();
                info!("lost {}", dev.address());
                callback(&[dev], &[]);
            }
        }
    }
    debug!("bus device watcher exiting");
}

// ── BusDeviceFactory ─────────────────────────────────────────────

/// Device factory for devices discovered on one bus domain.
pub struct BusDeviceFactory {
    watcher: BusDeviceWatcher,
}

impl BusDeviceFactory {
    pub fn new(participant: Participant, callback: DevicesChangedCallback) -> Result<Self> {
        Ok(Self {
            watcher: BusDeviceWatcher::start(participant, callback)?,
        })
    }

    pub fn watcher(&self) -> &BusDeviceWatcher {
        &self.watcher
    }
}

impl DeviceFactory for BusDeviceFactory {
    fn name(&self) -> &str {
        "bus"
    }

    /// Bus devices are software-only: they need `SW_ONLY` in the mask and
    /// a product line intersecting it.
    fn query_devices(&self, mask: ProductLine) -> Vec<DeviceRef> {
        if !mask.contains(ProductLine::SW_ONLY) {
            return Vec::new();
        }
        self.watcher
            .devices()
            .into_iter()
            .filter(|dev| mask.intersects(dev.product_line() & ProductLine::ANY))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{StreamKind, StreamProfile};

    fn announcement(root: &str, line: ProductLine) -> DeviceAnnouncement {
        DeviceAnnouncement {
            name: "sim".into(),
            serial: root.replace('/', "-"),
            product_line: line,
            topic_root: root.into(),
            streams: vec![StreamProfile::for_kind(StreamKind::Depth)],
        }
    }

    async fn wait_for(f: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn announcements_add_and_writer_loss_removes() {
        let host = Participant::new(225, "host").unwrap();
        let device = Participant::new(225, "device").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let factory = BusDeviceFactory::new(
            host,
            Arc::new(move |removed: &[DeviceRef], added: &[DeviceRef]| {
                sink.lock().push((removed.len(), added.len()));
            }),
        )
        .unwrap();

        let writer = device.create_writer(DEVICE_INFO_TOPIC, Qos::Reliable);
        let ann = announcement("cam/a", ProductLine::STEREO);
        writer.write_message(&ann).unwrap();
        writer.write_message(&ann).unwrap();

        assert!(wait_for(|| factory.watcher().devices().len() == 1).await);
        let any = ProductLine::ANY | ProductLine::SW_ONLY;
        let list = factory.query_devices(any);
        assert_eq!(list[0].address(), "bus.225/cam/a");
        assert!(list[0].remote().is_some());
        assert!(factory.query_devices(ProductLine::ANY).is_empty());
        assert!(factory.query_devices(ProductLine::TRACKING | ProductLine::SW_ONLY).is_empty());

        let dev = list[0].clone();
        drop(writer);
        assert!(wait_for(|| factory.watcher().devices().is_empty()).await);
        assert!(!dev.is_alive());
        assert_eq!(*events.lock(), [(0, 1), (1, 0)]);
    }

    #[tokio::test]
    async fn no_callback_after_stop() {
        let host = Participant::new(226, "host").unwrap();
        let device = Participant::new(226, "device").unwrap();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let watcher = BusDeviceWatcher::start(
            host,
            Arc::new(move |_: &[DeviceRef], _: &[DeviceRef]| *h.lock() += 1),
        )
        .unwrap();

        watcher.stop();
        watcher.stop();
        assert!(watcher.is_stopped());

        let writer = device.create_writer(DEVICE_INFO_TOPIC, Qos::Reliable);
        writer
            .write_message(&announcement("cam/b", ProductLine::LIDAR))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let host = Participant::new(227, "host").unwrap();
        let err = BusDeviceWatcher::start(host, Arc::new(|_: &[DeviceRef], _: &[DeviceRef]| {}))
            .err()
            .unwrap();
        assert!(matches!(err, CamlinkError::Transport(_)));
    }
}
