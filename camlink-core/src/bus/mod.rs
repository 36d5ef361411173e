//! In-process publish/subscribe bus.
//!
//! Participants join a numbered domain; participants in the same domain
//! share topics by name. Every reader on a topic matches every writer on
//! it. Delivery follows the reader's [`Qos`]:
//!
//! | QoS          | Queue     | When full                 |
//! |--------------|-----------|---------------------------|
//! | `Reliable`   | unbounded | never                     |
//! | `BestEffort` | bounded   | the new sample is dropped |
//!
//! Samples are stamped twice: with the writer participant's clock when
//! written and with the reader participant's clock when delivered, so two
//! participants with different clocks observe a real offset.

pub mod codec;
mod topic;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CamlinkError, Result};
use crate::time::{ClockRef, Nanos, SystemClock};

pub use topic::{Qos, ReaderEvent, Sample, SampleInfo, TopicReader, TopicWriter};

use topic::Topic;

/// Domain identifier. Valid range is `0..=MAX_DOMAIN_ID`.
pub type DomainId = u32;

pub const MAX_DOMAIN_ID: DomainId = 232;

// ── Guid ─────────────────────────────────────────────────────────

/// Process-unique identifier assigned to every participant and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(u64);

impl Guid {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Guid(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

// ── Domain ───────────────────────────────────────────────────────

struct Domain {
    id: DomainId,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl Domain {
    fn join(id: DomainId) -> Arc<Domain> {
        static DOMAINS: OnceLock<Mutex<HashMap<DomainId, Weak<Domain>>>> = OnceLock::new();
        let mut domains = DOMAINS.get_or_init(|| Mutex::new(HashMap::new())).lock();
        if let Some(domain) = domains.get(&id).and_then(Weak::upgrade) {
            return domain;
        }
        let domain = Arc::new(Domain {
            id,
            topics: Mutex::new(HashMap::new()),
        });
        domains.insert(id, Arc::downgrade(&domain));
        domain
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock();
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name)))
            .clone()
    }
}

// ── Participant ──────────────────────────────────────────────────

struct ParticipantInner {
    guid: Guid,
    name: String,
    domain: Arc<Domain>,
    clock: ClockRef,
}

/// Membership of one domain; creates topic readers and writers.
///
/// Cheap to clone; all clones are the same participant.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<ParticipantInner>,
}

impl Participant {
    /// Join `domain_id` using the system clock.
    pub fn new(domain_id: DomainId, name: impl Into<String>) -> Result<Self> {
        Self::with_clock(domain_id, name, Arc::new(SystemClock))
    }

    /// Join `domain_id` reading time from `clock`.
    pub fn with_clock(domain_id: DomainId, name: impl Into<String>, clock: ClockRef) -> Result<Self> {
        if domain_id > MAX_DOMAIN_ID {
            return Err(CamlinkError::Transport(format!(
                "invalid domain id {domain_id} (max {MAX_DOMAIN_ID})"
            )));
        }
        let name = name.into();
        let guid = Guid::next();
        debug!(domain = domain_id, %guid, "participant '{name}' joined");
        Ok(Self {
            inner: Arc::new(ParticipantInner {
                guid,
                name,
                domain: Domain::join(domain_id),
                clock,
            }),
        })
    }

    pub fn guid(&self) -> Guid {
        self.inner.guid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn domain_id(&self) -> DomainId {
        self.inner.domain.id
    }

    pub fn clock(&self) -> &ClockRef {
        &self.inner.clock
    }

    /// Current time on this participant's clock.
    pub fn now(&self) -> Nanos {
        self.inner.clock.now()
    }

    pub fn create_writer(&self, topic: &str, qos: Qos) -> TopicWriter {
        TopicWriter::attach(self.inner.domain.topic(topic), self.inner.clock.clone(), qos)
    }

    pub fn create_reader(&self, topic: &str, qos: Qos) -> TopicReader {
        TopicReader::attach(self.inner.domain.topic(topic), self.inner.clock.clone(), qos)
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("guid", &self.inner.guid)
            .field("name", &self.inner.name)
            .field("domain", &self.inner.domain.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_domain() {
        let err = Participant::new(MAX_DOMAIN_ID + 1, "p").unwrap_err();
        assert!(matches!(err, CamlinkError::Transport(_)));
    }

    #[test]
    fn guids_are_unique() {
        let a = Participant::new(200, "a").unwrap();
        let b = Participant::new(200, "b").unwrap();
        assert_ne!(a.guid(), b.guid());
        assert_eq!(a.domain_id(), 200);
        assert_eq!(b.name(), "b");
    }

    #[test]
    fn same_domain_shares_topics() {
        let a = Participant::new(201, "a").unwrap();
        let b = Participant::new(201, "b").unwrap();
        let c = Participant::new(202, "c").unwrap();

        let writer = a.create_writer("t", Qos::Reliable);
        let _reader = b.create_reader("t", Qos::Reliable);
        let _other = c.create_reader("t", Qos::Reliable);
        assert_eq!(writer.matched_readers(), 1);
    }
}
