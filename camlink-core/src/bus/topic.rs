//! Topic endpoints: writers fan samples out to every matched reader.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use super::Guid;
use super::codec;
use crate::error::{CamlinkError, Result};
use crate::time::{ClockRef, Nanos};

/// Queue depth of a best-effort reader.
const BEST_EFFORT_DEPTH: usize = 64;

/// Delivery guarantee requested by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Every sample is delivered, in write order.
    #[default]
    Reliable,
    /// Samples arriving while the queue is full are dropped.
    BestEffort,
}

// ── Samples ──────────────────────────────────────────────────────

/// Transport metadata attached to every delivered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// The writer that published the sample.
    pub writer: Guid,
    /// Writer participant's clock at write time.
    pub source_timestamp: Nanos,
    /// Reader participant's clock at delivery time.
    pub reception_timestamp: Nanos,
}

/// One delivered payload.
#[derive(Debug, Clone)]
pub struct Sample {
    pub payload: Bytes,
    pub info: SampleInfo,
}

impl Sample {
    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.payload)
    }
}

/// What a reader observes on its topic.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    Data(Sample),
    /// A matched writer went away (dropped or its participant left).
    WriterGone(Guid),
}

// ── Topic ────────────────────────────────────────────────────────

enum ReaderTx {
    Reliable(mpsc::UnboundedSender<ReaderEvent>),
    BestEffort(mpsc::Sender<ReaderEvent>),
}

impl ReaderTx {
    fn deliver(&self, event: ReaderEvent) {
        match self {
            ReaderTx::Reliable(tx) => {
                let _ = tx.send(event);
            }
            ReaderTx::BestEffort(tx) => {
                if tx.try_send(event).is_err() {
                    trace!("best-effort reader queue full; sample dropped");
                }
            }
        }
    }
}

struct ReaderSlot {
    guid: Guid,
    clock: ClockRef,
    tx: ReaderTx,
    writers: watch::Sender<usize>,
}

struct WriterSlot {
    guid: Guid,
    readers: watch::Sender<usize>,
}

#[derive(Default)]
struct TopicState {
    readers: Vec<ReaderSlot>,
    writers: Vec<WriterSlot>,
}

impl TopicState {
    fn publish_counts(&self) {
        for w in &self.writers {
            w.readers.send_replace(self.readers.len());
        }
        for r in &self.readers {
            r.writers.send_replace(self.writers.len());
        }
    }
}

pub(super) struct Topic {
    name: String,
    state: Mutex<TopicState>,
}

impl Topic {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState::default()),
        }
    }
}

// ── TopicWriter ──────────────────────────────────────────────────

/// Publishes samples on one topic.
pub struct TopicWriter {
    topic: Arc<Topic>,
    guid: Guid,
    clock: ClockRef,
    matches: watch::Receiver<usize>,
}

impl TopicWriter {
    pub(super) fn attach(topic: Arc<Topic>, clock: ClockRef, _qos: Qos) -> Self {
        let guid = Guid::next();
        let (tx, rx) = watch::channel(0);
        {
            let mut state = topic.state.lock();
            state.writers.push(WriterSlot { guid, readers: tx });
            state.publish_counts();
        }
        Self {
            topic,
            guid,
            clock,
            matches: rx,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn topic_name(&self) -> &str {
        &self.topic.name
    }

    /// Publish raw bytes to every matched reader.
    pub fn write(&self, payload: Bytes) -> Result<()> {
        let state = self.topic.state.lock();
        let source_timestamp = self.clock.now();
        for reader in &state.readers {
            let info = SampleInfo {
                writer: self.guid,
                source_timestamp,
                reception_timestamp: reader.clock.now(),
            };
            reader.tx.deliver(ReaderEvent::Data(Sample {
                payload: payload.clone(),
                info,
            }));
        }
        Ok(())
    }

    /// Encode `msg` and publish it.
    pub fn write_message<T: Serialize>(&self, msg: &T) -> Result<()> {
        self.write(codec::encode(msg)?)
    }

    /// Number of readers currently matched.
    pub fn matched_readers(&self) -> usize {
        *self.matches.borrow()
    }

    /// A receiver that changes whenever the match count changes.
    pub fn subscribe_matches(&self) -> watch::Receiver<usize> {
        self.matches.clone()
    }

    /// Block until at least `count` readers are matched.
    pub async fn wait_for_readers(&self, count: usize, timeout: Duration) -> Result<()> {
        let mut rx = self.matches.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CamlinkError::ChannelClosed),
            Err(_) => Err(CamlinkError::Timeout(timeout)),
        }
    }
}

impl Drop for TopicWriter {
    fn drop(&mut self) {
        let mut state = self.topic.state.lock();
        state.writers.retain(|w| w.guid != self.guid);
        for reader in &state.readers {
            reader.tx.deliver(ReaderEvent::WriterGone(self.guid));
        }
        state.publish_counts();
    }
}

// ── TopicReader ──────────────────────────────────────────────────

enum ReaderRx {
    Reliable(mpsc::UnboundedReceiver<ReaderEvent>),
    BestEffort(mpsc::Receiver<ReaderEvent>),
}

/// Receives samples published on one topic.
pub struct TopicReader {
    topic: Arc<Topic>,
    guid: Guid,
    rx: ReaderRx,
    writers: watch::Receiver<usize>,
}

impl TopicReader {
    pub(super) fn attach(topic: Arc<Topic>, clock: ClockRef, qos: Qos) -> Self {
        let guid = Guid::next();
        let (tx, rx) = match qos {
            Qos::Reliable => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ReaderTx::Reliable(tx), ReaderRx::Reliable(rx))
            }
            Qos::BestEffort => {
                let (tx, rx) = mpsc::channel(BEST_EFFORT_DEPTH);
                (ReaderTx::BestEffort(tx), ReaderRx::BestEffort(rx))
            }
        };
        let (writers_tx, writers_rx) = watch::channel(0);
        {
            let mut state = topic.state.lock();
            state.readers.push(ReaderSlot {
                guid,
                clock,
                tx,
                writers: writers_tx,
            });
            state.publish_counts();
        }
        Self {
            topic,
            guid,
            rx,
            writers: writers_rx,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn topic_name(&self) -> &str {
        &self.topic.name
    }

    /// Next data sample or writer-gone event.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        match &mut self.rx {
            ReaderRx::Reliable(rx) => rx.recv().await,
            ReaderRx::BestEffort(rx) => rx.recv().await,
        }
    }

    /// Next data sample, skipping liveness events.
    pub async fn read(&mut self) -> Option<Sample> {
        loop {
            match self.next_event().await? {
                ReaderEvent::Data(sample) => return Some(sample),
                ReaderEvent::WriterGone(_) => continue,
            }
        }
    }

    /// Next data sample, failing with `Timeout` after `timeout`.
    pub async fn read_timeout(&mut self, timeout: Duration) -> Result<Sample> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(Some(sample)) => Ok(sample),
            Ok(None) => Err(CamlinkError::ChannelClosed),
            Err(_) => Err(CamlinkError::Timeout(timeout)),
        }
    }

    /// Number of writers currently matched.
    pub fn matched_writers(&self) -> usize {
        *self.writers.borrow()
    }

    /// Block until at least `count` writers are matched.
    pub async fn wait_for_writers(&self, count: usize, timeout: Duration) -> Result<()> {
        let mut rx = self.writers.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CamlinkError::ChannelClosed),
            Err(_) => Err(CamlinkError::Timeout(timeout)),
        }
    }
}

impl Drop for TopicReader {
    fn drop(&mut self) {
        let mut state = self.topic.state.lock();
        state.readers.retain(|r| r.guid != self.guid);
        state.publish_counts();
    }
}
