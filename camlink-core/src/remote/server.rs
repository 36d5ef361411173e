//! Device side of the control protocol: a simulated remote device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcaster::DeviceBroadcaster;
use super::stream::StreamWriter;
use crate::bus::{Participant, Qos, Sample, TopicReader, TopicWriter};
use crate::error::{CamlinkError, Result};
use crate::protocol::{
    ControlMessage, ControlOp, DeviceAnnouncement, DeviceSnapshot, Notification, StreamProfile,
    StreamStatus, SyncReply, control_topic, notification_topic,
};
use crate::task::Worker;
use crate::time::Nanos;

/// Hosts one device on a participant.
///
/// Listens on `<root>/control`, answers on `<root>/notification`, runs one
/// [`StreamWriter`] per opened stream and announces itself through a
/// [`DeviceBroadcaster`]. Everything is torn down when the server stops or
/// receives [`ControlOp::Exit`].
pub struct DeviceServer {
    announcement: DeviceAnnouncement,
    worker: Worker,
    exited: CancellationToken,
    snapshot: Arc<Mutex<DeviceSnapshot>>,
}

impl DeviceServer {
    pub fn start(
        participant: &Participant,
        announcement: DeviceAnnouncement,
        frame_interval: Duration,
    ) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("device server needs a runtime: {e}")))?;

        let root = &announcement.topic_root;
        let control = participant.create_reader(&control_topic(root), Qos::Reliable);
        let notifier = participant.create_writer(&notification_topic(root), Qos::Reliable);
        let snapshot = Arc::new(Mutex::new(DeviceSnapshot {
            streams: announcement
                .streams
                .iter()
                .map(|p| StreamStatus {
                    name: p.stream.clone(),
                    open: false,
                    streaming: false,
                })
                .collect(),
        }));
        // Endpoints exist before the device is announced.
        let broadcaster = DeviceBroadcaster::start(participant, announcement.clone())?;
        let exited = CancellationToken::new();

        let device = Device {
            participant: participant.clone(),
            announcement: announcement.clone(),
            notifier,
            snapshot: snapshot.clone(),
            streams: HashMap::new(),
            frame_interval,
        };
        let worker = {
            let exited = exited.clone();
            Worker::spawn(format!("device-server:{root}"), move |token| {
                serve(device, control, broadcaster, exited, token)
            })
        };
        info!("device '{}' serving on {root}", announcement.name);

        Ok(Self {
            announcement,
            worker,
            exited,
            snapshot,
        })
    }

    pub fn announcement(&self) -> &DeviceAnnouncement {
        &self.announcement
    }

    /// Stream state as of the last `Open`/`Close`.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn is_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Resolves once the host sent `Exit`.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// Stop serving and withdraw the device. Idempotent.
    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }
}

/// State owned by the serving task.
struct Device {
    participant: Participant,
    announcement: DeviceAnnouncement,
    notifier: TopicWriter,
    snapshot: Arc<Mutex<DeviceSnapshot>>,
    streams: HashMap<String, StreamWriter>,
    frame_interval: Duration,
}

impl Device {
    fn notify(&self, notification: &Notification) {
        if let Err(e) = self.notifier.write_message(notification) {
            warn!("{}: notification failed: {e}", self.announcement.topic_root);
        }
    }

    fn ack(&self, sample: &Sample, sequence: u32, result: Result<()>) {
        self.notify(&Notification::Ack {
            requester: sample.info.writer,
            sequence,
            error: result.err().map(|e| e.to_string()),
        });
    }

    fn sync_reply(&self, sample: &Sample, iteration: u64, t0: Nanos) {
        let reply = SyncReply {
            requester: sample.info.writer,
            iteration,
            t0,
            t1: sample.info.reception_timestamp,
            t2: self.participant.now(),
        };
        self.notify(&Notification::SyncReply(reply));
    }

    fn stream_id(&self, name: &str) -> Option<u32> {
        self.announcement
            .streams
            .iter()
            .position(|p| p.stream == name)
            .map(|i| i as u32)
    }

    fn open(&mut self, profiles: &[StreamProfile]) -> Result<()> {
        if let Some(p) = profiles.iter().find(|p| self.stream_id(&p.stream).is_none()) {
            return Err(CamlinkError::UnknownStream(p.stream.clone()));
        }
        for profile in profiles {
            if self.streams.contains_key(&profile.stream) {
                continue;
            }
            let id = self.stream_id(&profile.stream).unwrap_or_default();
            debug!(
                "opening '{}' {}x{}@{}",
                profile.stream, profile.width, profile.height, profile.fps
            );
            let writer = StreamWriter::start(
                &self.participant,
                &self.announcement.topic_root,
                profile,
                id,
                self.frame_interval,
            )?;
            self.streams.insert(profile.stream.clone(), writer);
        }
        Ok(())
    }

    async fn close(&mut self, names: &[String]) -> Result<()> {
        if let Some(n) = names.iter().find(|n| self.stream_id(n).is_none()) {
            return Err(CamlinkError::UnknownStream(n.clone()));
        }
        for name in names {
            if let Some(mut writer) = self.streams.remove(name) {
                writer.stop().await;
                debug!("closed '{name}' after {} frames", writer.frames_sent());
            }
        }
        Ok(())
    }

    fn publish_state(&self) {
        let snapshot = {
            let mut snapshot = self.snapshot.lock();
            for status in &mut snapshot.streams {
                let writer = self.streams.get(&status.name);
                status.open = writer.is_some();
                status.streaming = writer.is_some_and(StreamWriter::is_streaming);
            }
            snapshot.clone()
        };
        self.notify(&Notification::State(snapshot));
    }

    async fn shutdown(&mut self) {
        let mut writers: Vec<StreamWriter> = self.streams.drain().map(|(_, w)| w).collect();
        join_all(writers.iter_mut().map(|w| w.stop())).await;
    }
}

async fn serve(
    mut device: Device,
    mut control: TopicReader,
    mut broadcaster: DeviceBroadcaster,
    exited: CancellationToken,
    token: CancellationToken,
) {
    loop {
        let sample = tokio::select! {
            _ = token.cancelled() => break,
            sample = control.read() => sample,
        };
        let Some(sample) = sample else { break };
        let msg: ControlMessage = match sample.decode() {
            Ok(m) => m,
            Err(e) => {
                warn!("{}: undecodable control message: {e}", device.announcement.topic_root);
                continue;
            }
        };
        debug!("{}: {} #{}", device.announcement.topic_root, msg.op, msg.sequence);

        match msg.op {
            ControlOp::Sync { iteration, t0 } => {
                device.sync_reply(&sample, iteration, t0);
                device.ack(&sample, msg.sequence, Ok(()));
            }
            ControlOp::Open { profiles } => {
                let result = device.open(&profiles);
                device.publish_state();
                device.ack(&sample, msg.sequence, result);
            }
            ControlOp::Close { streams } => {
                let result = device.close(&streams).await;
                device.publish_state();
                device.ack(&sample, msg.sequence, result);
            }
            ControlOp::Exit => {
                info!("{}: exit requested", device.announcement.topic_root);
                device.ack(&sample, msg.sequence, Ok(()));
                exited.cancel();
                break;
            }
        }
    }

    device.shutdown().await;
    broadcaster.stop().await;
}
