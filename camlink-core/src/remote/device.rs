//! Host-side session with one remote device.
//!
//! ```text
//!  RemoteDevice
//!    ├─ control writer     <root>/control       sequenced ControlMessage
//!    └─ listener task      <root>/notification  State / Ack / SyncReply
//! ```
//!
//! Every control message takes the next sequence number, starting at 0.
//! Numbers are never reused, including for messages that failed to send.
//! Once the device's notification writer disappears, or the session is
//! disconnected, every further command fails with
//! [`CamlinkError::SessionInvalid`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::stream::{StreamConsumer, stream_reader};
use crate::bus::{Guid, Participant, Qos, ReaderEvent, TopicReader, TopicWriter};
use crate::device::DeviceRef;
use crate::error::{CamlinkError, Result};
use crate::protocol::{
    ControlMessage, ControlOp, DeviceAnnouncement, DeviceSnapshot, Notification, StreamProfile,
    control_topic, notification_topic,
};
use crate::sync::SyncSample;
use crate::task::Worker;
use crate::time::Nanos;

/// How long `open`/`close` wait for the device's acknowledgement.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ── Shared session state ─────────────────────────────────────────

/// A command waiting for its `Ack`.
struct PendingCommand {
    op: &'static str,
    sent_at: Instant,
    reply: oneshot::Sender<Result<()>>,
}

struct SessionState {
    address: String,
    valid: AtomicBool,
    snapshot: Mutex<DeviceSnapshot>,
    pending: Mutex<HashMap<u32, PendingCommand>>,
}

impl SessionState {
    fn invalid_error(&self) -> CamlinkError {
        CamlinkError::SessionInvalid(self.address.clone())
    }

    /// Mark the session unusable and fail every in-flight command.
    fn invalidate(&self, reason: &str) {
        if self.valid.swap(false, Ordering::AcqRel) {
            info!("{}: session ended ({reason})", self.address);
        }
        let drained: Vec<PendingCommand> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in drained {
            let _ = p.reply.send(Err(self.invalid_error()));
        }
    }

    fn resolve(&self, sequence: u32, error: Option<String>) {
        let Some(p) = self.pending.lock().remove(&sequence) else {
            trace!("{}: ack for untracked sequence {sequence}", self.address);
            return;
        };
        debug!(
            "{}: {} #{sequence} acknowledged after {:?}",
            self.address,
            p.op,
            p.sent_at.elapsed()
        );
        let result = match error {
            None => Ok(()),
            Some(e) => Err(CamlinkError::Transport(format!("device rejected {}: {e}", p.op))),
        };
        let _ = p.reply.send(result);
    }
}

struct ControlChannel {
    writer: TopicWriter,
    next_sequence: u32,
}

// ── RemoteDevice ─────────────────────────────────────────────────

/// An open session with a device discovered on the bus.
pub struct RemoteDevice {
    device: DeviceRef,
    participant: Participant,
    announcement: DeviceAnnouncement,
    control: Mutex<ControlChannel>,
    state: Arc<SessionState>,
    sync_replies: AsyncMutex<mpsc::UnboundedReceiver<SyncSample>>,
    listener: Mutex<Option<Worker>>,
    command_timeout: Duration,
}

impl RemoteDevice {
    /// Open a session with a bus device. Needs a Tokio runtime.
    ///
    /// No control traffic is sent until the caller issues a command.
    pub fn connect(device: &DeviceRef) -> Result<Self> {
        let handle = device.remote().ok_or_else(|| {
            CamlinkError::Transport(format!("{} is not a bus device", device.address()))
        })?;
        if !device.is_alive() {
            return Err(CamlinkError::SessionInvalid(device.address().to_string()));
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("session needs a runtime: {e}")))?;

        let participant = handle.participant.clone();
        let root = &handle.announcement.topic_root;
        let notifications = participant.create_reader(&notification_topic(root), Qos::Reliable);
        let writer = participant.create_writer(&control_topic(root), Qos::Reliable);
        let requester = writer.guid();

        let state = Arc::new(SessionState {
            address: device.address().to_string(),
            valid: AtomicBool::new(true),
            snapshot: Mutex::new(DeviceSnapshot::default()),
            pending: Mutex::new(HashMap::new()),
        });
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();

        let listener = {
            let participant = participant.clone();
            let state = state.clone();
            Worker::spawn(format!("session:{}", device.address()), move |token| {
                listen(participant, requester, notifications, state, sync_tx, token)
            })
        };
        info!("{}: session opened", device.address());

        Ok(Self {
            device: device.clone(),
            participant,
            announcement: handle.announcement.clone(),
            control: Mutex::new(ControlChannel {
                writer,
                next_sequence: 0,
            }),
            state,
            sync_replies: AsyncMutex::new(sync_rx),
            listener: Mutex::new(Some(listener)),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        self.device.address()
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn announcement(&self) -> &DeviceAnnouncement {
        &self.announcement
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Sequence number the next control message will carry.
    pub fn next_sequence(&self) -> u32 {
        self.control.lock().next_sequence
    }

    /// Last state snapshot published by the device.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.state.snapshot.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::Acquire) && self.device.is_alive()
    }

    fn ensure_valid(&self) -> Result<()> {
        if !self.device.is_alive() {
            self.state.invalidate("device gone");
        }
        if !self.state.valid.load(Ordering::Acquire) {
            return Err(self.state.invalid_error());
        }
        Ok(())
    }

    fn has_stream(&self, name: &str) -> bool {
        self.announcement.streams.iter().any(|s| s.stream == name)
    }

    /// Publish `op` tagged with the next sequence number.
    ///
    /// Returns the sequence number used.
    pub fn write_control_message(&self, op: ControlOp) -> Result<u32> {
        self.send(op, None)
    }

    fn send(&self, op: ControlOp, reply: Option<oneshot::Sender<Result<()>>>) -> Result<u32> {
        self.ensure_valid()?;
        let mut control = self.control.lock();
        let sequence = control.next_sequence;
        control.next_sequence = sequence.wrapping_add(1);

        let name = op.name();
        if let Some(reply) = reply {
            let mut pending = self.state.pending.lock();
            if !self.state.valid.load(Ordering::Acquire) {
                return Err(self.state.invalid_error());
            }
            pending.insert(
                sequence,
                PendingCommand {
                    op: name,
                    sent_at: Instant::now(),
                    reply,
                },
            );
        }

        if let Err(e) = control.writer.write_message(&ControlMessage { sequence, op }) {
            self.state.pending.lock().remove(&sequence);
            return Err(e);
        }
        debug!("{}: sent {name} #{sequence}", self.address());
        Ok(sequence)
    }

    /// Send `op` and wait for the device to acknowledge it.
    async fn command(&self, op: ControlOp) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let sequence = self.send(op, Some(tx))?;
        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.state.invalid_error()),
            Err(_) => {
                self.state.pending.lock().remove(&sequence);
                Err(CamlinkError::Timeout(self.command_timeout))
            }
        }
    }

    /// Activate streams with the given profiles.
    pub async fn open(&self, profiles: Vec<StreamProfile>) -> Result<()> {
        if let Some(p) = profiles.iter().find(|p| !self.has_stream(&p.stream)) {
            return Err(CamlinkError::UnknownStream(p.stream.clone()));
        }
        self.command(ControlOp::Open { profiles }).await
    }

    /// Deactivate the named streams.
    pub async fn close(&self, streams: Vec<String>) -> Result<()> {
        if let Some(s) = streams.iter().find(|s| !self.has_stream(s)) {
            return Err(CamlinkError::UnknownStream(s.clone()));
        }
        self.command(ControlOp::Close { streams }).await
    }

    /// Ask the device to shut down.
    pub async fn exit(&self) -> Result<()> {
        self.command(ControlOp::Exit).await
    }

    /// One clock-sync round trip. Rounds are serialized per session.
    pub async fn sync_round(&self, iteration: u64, timeout: Duration) -> Result<SyncSample> {
        let mut replies = self.sync_replies.lock().await;
        let t0 = self.participant.now();
        self.write_control_message(ControlOp::Sync { iteration, t0 })?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => return Err(CamlinkError::Timeout(timeout)),
                Ok(None) => return Err(self.state.invalid_error()),
                Ok(Some(s)) if s.iteration == iteration && s.t0 == t0 => return Ok(s),
                Ok(Some(stale)) => {
                    debug!("{}: stale sync reply #{}", self.address(), stale.iteration)
                }
            }
        }
    }

    /// Start consuming `stream`, correcting transit by `clock_offset`.
    pub fn subscribe(&self, stream: &str, clock_offset: Nanos) -> Result<StreamConsumer> {
        self.ensure_valid()?;
        if !self.has_stream(stream) {
            return Err(CamlinkError::UnknownStream(stream.to_string()));
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("stream consumer needs a runtime: {e}")))?;
        let reader = stream_reader(&self.participant, &self.announcement.topic_root, stream);
        Ok(StreamConsumer::spawn(stream, reader, clock_offset))
    }

    /// End the session and join the listener. Idempotent.
    pub async fn disconnect(&self) {
        self.state.invalidate("disconnected");
        let listener = self.listener.lock().take();
        if let Some(mut worker) = listener {
            worker.stop().await;
        }
    }
}

impl Drop for RemoteDevice {
    fn drop(&mut self) {
        self.state.invalidate("dropped");
    }
}

async fn listen(
    participant: Participant,
    requester: Guid,
    mut reader: TopicReader,
    state: Arc<SessionState>,
    sync_tx: mpsc::UnboundedSender<SyncSample>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = reader.next_event() => event,
        };
        let sample = match event {
            Some(ReaderEvent::Data(sample)) => sample,
            Some(ReaderEvent::WriterGone(_)) | None => {
                state.invalidate("device gone");
                break;
            }
        };
        let notification: Notification = match sample.decode() {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: undecodable notification: {e}", state.address);
                continue;
            }
        };
        match notification {
            Notification::State(snapshot) => *state.snapshot.lock() = snapshot,
            Notification::Ack {
                requester: from,
                sequence,
                error,
            } => {
                if from == requester {
                    state.resolve(sequence, error);
                }
            }
            Notification::SyncReply(reply) if reply.requester != requester => {}
            Notification::SyncReply(reply) => {
                let _ = sync_tx.send(SyncSample {
                    iteration: reply.iteration,
                    t0: reply.t0,
                    t1: reply.t1,
                    t2: reply.t2,
                    t3: sample.info.reception_timestamp,
                    processed: participant.now(),
                });
            }
        }
    }
}
