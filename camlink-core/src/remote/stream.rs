//! Stream channels: match-driven frame emission and frame accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Participant, Qos, ReaderEvent, TopicReader, TopicWriter};
use crate::error::{CamlinkError, Result};
use crate::protocol::{Frame, StreamProfile, stream_topic};
use crate::stats::StreamStats;
use crate::task::Worker;
use crate::time::Nanos;

/// Default time between two emitted frames.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(23);

/// Payload size of a simulated frame.
pub const FRAME_PAYLOAD_SIZE: usize = 2048;

// ── StreamWriter ─────────────────────────────────────────────────

/// Device-side stream endpoint.
///
/// Emission starts when the reader match count goes from 0 to >0 and stops
/// (the emission task is joined) when it returns to 0. Frame numbers keep
/// increasing across restarts.
pub struct StreamWriter {
    name: String,
    supervisor: Worker,
    streaming: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl StreamWriter {
    pub fn start(
        participant: &Participant,
        topic_root: &str,
        profile: &StreamProfile,
        stream_id: u32,
        interval: Duration,
    ) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| CamlinkError::Transport(format!("stream writer needs a runtime: {e}")))?;

        let name = profile.stream.clone();
        let writer = Arc::new(participant.create_writer(&stream_topic(topic_root, &name), Qos::BestEffort));
        let streaming = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));

        let supervisor = {
            let name = name.clone();
            let streaming = streaming.clone();
            let frames = frames.clone();
            Worker::spawn(format!("stream-supervisor:{name}"), move |token| {
                supervise(name, writer, stream_id, interval, streaming, frames, token)
            })
        };

        Ok(Self {
            name,
            supervisor,
            streaming,
            frames,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the emission loop is currently running.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Frames emitted so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop emission and the supervisor. Idempotent.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }
}

async fn supervise(
    name: String,
    writer: Arc<TopicWriter>,
    stream_id: u32,
    interval: Duration,
    streaming: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut matches = writer.subscribe_matches();
    let mut emitter: Option<Worker> = None;

    loop {
        let matched = *matches.borrow_and_update();
        match (matched > 0, emitter.is_some()) {
            (true, false) => {
                info!("stream '{name}': {matched} reader(s) matched, starting");
                let writer = writer.clone();
                let frames = frames.clone();
                emitter = Some(Worker::spawn(format!("stream-emitter:{name}"), move |token| {
                    emit(writer, stream_id, interval, frames, token)
                }));
                streaming.store(true, Ordering::Release);
            }
            (false, true) => {
                info!("stream '{name}': no readers, stopping");
                if let Some(mut w) = emitter.take() {
                    w.stop().await;
                }
                streaming.store(false, Ordering::Release);
            }
            _ => {}
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = matches.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(mut w) = emitter.take() {
        w.stop().await;
    }
    streaming.store(false, Ordering::Release);
    debug!("stream '{name}' closed after {} frames", frames.load(Ordering::Relaxed));
}

async fn emit(
    writer: Arc<TopicWriter>,
    stream_id: u32,
    interval: Duration,
    frames: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let data = vec![0xa5u8; FRAME_PAYLOAD_SIZE];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let frame = Frame {
                    stream_id,
                    frame_number: frames.load(Ordering::Relaxed),
                    data: data.clone(),
                };
                if let Err(e) = writer.write_message(&frame) {
                    warn!("{}: frame {} not sent: {e}", writer.topic_name(), frame.frame_number);
                }
                frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ── StreamConsumer ───────────────────────────────────────────────

/// Host-side stream endpoint that accounts every received frame.
pub struct StreamConsumer {
    name: String,
    worker: Worker<StreamStats>,
}

impl StreamConsumer {
    /// Start consuming `reader`, correcting transit times by `clock_offset`
    /// (`host - device`).
    pub fn spawn(name: impl Into<String>, reader: TopicReader, clock_offset: Nanos) -> Self {
        let name = name.into();
        let worker = {
            let name = name.clone();
            Worker::spawn(format!("stream-consumer:{name}"), move |token| {
                consume(name, reader, clock_offset, token)
            })
        };
        Self { name, worker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop consuming and return the final counters.
    pub async fn finish(mut self) -> StreamStats {
        let name = self.name.clone();
        self.worker
            .stop()
            .await
            .unwrap_or_else(|| StreamStats::new(name))
    }
}

async fn consume(
    name: String,
    mut reader: TopicReader,
    clock_offset: Nanos,
    token: CancellationToken,
) -> StreamStats {
    let mut stats = StreamStats::new(name);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = reader.next_event() => event,
        };
        match event {
            Some(ReaderEvent::Data(sample)) => match sample.decode::<Frame>() {
                Ok(frame) => stats.record(
                    frame.frame_number,
                    sample.info.source_timestamp,
                    sample.info.reception_timestamp,
                    clock_offset,
                ),
                Err(e) => warn!("stream '{}': undecodable frame: {e}", stats.name),
            },
            Some(ReaderEvent::WriterGone(guid)) => {
                debug!("stream '{}': writer {guid} gone", stats.name)
            }
            None => break,
        }
    }
    stats
}

/// Reader on a device's stream topic, as used by [`StreamConsumer`].
pub(crate) fn stream_reader(participant: &Participant, topic_root: &str, stream: &str) -> TopicReader {
    participant.create_reader(&stream_topic(topic_root, stream), Qos::BestEffort)
}
