//! Device-side announcement publisher.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Participant, Qos, TopicWriter};
use crate::error::{CamlinkError, Result};
use crate::protocol::{DEVICE_INFO_TOPIC, DeviceAnnouncement};
use crate::task::Worker;

/// Publishes a device's announcement on `camlink/device-info`.
///
/// The announcement is written again every time a new reader matches, so
/// late watchers still discover the device. Stopping the broadcaster drops
/// its writer, which readers observe as the device going away.
pub struct DeviceBroadcaster {
    worker: Worker,
}

impl DeviceBroadcaster {
    /// Start announcing. Needs a Tokio runtime.
    pub fn start(participant: &Participant, announcement: DeviceAnnouncement) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("broadcaster needs a runtime: {e}")))?;

        let writer = participant.create_writer(DEVICE_INFO_TOPIC, Qos::Reliable);
        let worker = Worker::spawn(format!("broadcaster:{}", announcement.topic_root), move |token| {
            broadcast(writer, announcement, token)
        });
        Ok(Self { worker })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }
}

async fn broadcast(writer: TopicWriter, announcement: DeviceAnnouncement, token: CancellationToken) {
    let mut matches = writer.subscribe_matches();
    let mut last = 0;
    loop {
        let matched = *matches.borrow_and_update();
        if matched > last {
            debug!("announcing {} to {matched} reader(s)", announcement.topic_root);
            if let Err(e) = writer.write_message(&announcement) {
                warn!("announcement of {} failed: {e}", announcement.topic_root);
            }
        }
        last = matched;

        tokio::select! {
            _ = token.cancelled() => break,
            changed = matches.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::ReaderEvent;
    use crate::mask::ProductLine;

    fn announcement() -> DeviceAnnouncement {
        DeviceAnnouncement {
            name: "sim".into(),
            serial: "0001".into(),
            product_line: ProductLine::STEREO,
            topic_root: "cam/0001".into(),
            streams: Vec::new(),
        }
    }

    #[tokio::test]
    async fn late_reader_receives_announcement() {
        let device = Participant::new(228, "device").unwrap();
        let host = Participant::new(228, "host").unwrap();
        let mut broadcaster = DeviceBroadcaster::start(&device, announcement()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut reader = host.create_reader(DEVICE_INFO_TOPIC, Qos::Reliable);
        let sample = reader.read_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sample.decode::<DeviceAnnouncement>().unwrap(), announcement());

        broadcaster.stop().await;
        assert!(!broadcaster.is_running());
        match reader.next_event().await {
            Some(ReaderEvent::WriterGone(g)) => assert_eq!(g, sample.info.writer),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let device = Participant::new(229, "device").unwrap();
        let err = DeviceBroadcaster::start(&device, announcement()).err().unwrap();
        assert!(matches!(err, CamlinkError::Transport(_)));
    }
}
