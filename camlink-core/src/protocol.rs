//! Discovery, control and stream message types.
//!
//! ```text
//!  device ── camlink/device-info ──────────► host   (announcements)
//!  host   ── <root>/control ──────────────► device  (sequenced commands)
//!  device ── <root>/notification ─────────► host    (state, acks, sync replies)
//!  device ── <root>/<stream> ─────────────► host    (frames)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::Guid;
use crate::mask::ProductLine;
use crate::time::Nanos;

/// Topic on which devices announce themselves.
pub const DEVICE_INFO_TOPIC: &str = "camlink/device-info";

pub fn control_topic(topic_root: &str) -> String {
    format!("{topic_root}/control")
}

pub fn notification_topic(topic_root: &str) -> String {
    format!("{topic_root}/notification")
}

pub fn stream_topic(topic_root: &str, stream: &str) -> String {
    format!("{topic_root}/{stream}")
}

// ── Discovery ────────────────────────────────────────────────────

/// Static descriptor a remote device publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub name: String,
    pub serial: String,
    pub product_line: ProductLine,
    /// Prefix of every per-device topic.
    pub topic_root: String,
    /// Streams the device can produce.
    pub streams: Vec<StreamProfile>,
}

// ── Streams ──────────────────────────────────────────────────────

/// Kind of data carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Color,
    Depth,
    Gyro,
    Imu,
    Safety,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Color,
        StreamKind::Depth,
        StreamKind::Gyro,
        StreamKind::Imu,
        StreamKind::Safety,
    ];

    /// Bit used by stream-enable masks.
    pub fn flag(&self) -> u32 {
        match self {
            StreamKind::Color => 0x1,
            StreamKind::Depth => 0x2,
            StreamKind::Gyro => 0x4,
            StreamKind::Imu => 0x8,
            StreamKind::Safety => 0x10,
        }
    }

    /// Conventional stream (and topic suffix) name.
    pub fn stream_name(&self) -> &'static str {
        match self {
            StreamKind::Color => "rgb",
            StreamKind::Depth => "depth",
            StreamKind::Gyro => "gyro",
            StreamKind::Imu => "imu",
            StreamKind::Safety => "safety",
        }
    }

    /// Kinds selected by an enable mask, in flag order.
    pub fn from_mask(mask: u32) -> Vec<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .filter(|k| mask & k.flag() != 0)
            .collect()
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_name())
    }
}

/// A negotiable stream configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub stream: String,
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamProfile {
    /// Default profile for a stream kind.
    pub fn for_kind(kind: StreamKind) -> Self {
        let (width, height, fps) = match kind {
            StreamKind::Color => (1280, 720, 30),
            StreamKind::Depth => (1280, 960, 30),
            StreamKind::Gyro | StreamKind::Imu => (1, 1, 200),
            StreamKind::Safety => (320, 240, 30),
        };
        Self {
            stream: kind.stream_name().to_string(),
            kind,
            width,
            height,
            fps,
        }
    }
}

/// One frame published on a stream topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub stream_id: u32,
    /// Strictly increasing per stream, starting at 0.
    pub frame_number: u64,
    pub data: Vec<u8>,
}

// ── Control ──────────────────────────────────────────────────────

/// Operation requested by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOp {
    /// Activate streams with the given profiles.
    Open { profiles: Vec<StreamProfile> },
    /// Deactivate the named streams.
    Close { streams: Vec<String> },
    /// Clock-sync request; `t0` is the host's send time.
    Sync { iteration: u64, t0: Nanos },
    /// Ask the device to shut down.
    Exit,
}

impl ControlOp {
    pub fn name(&self) -> &'static str {
        match self {
            ControlOp::Open { .. } => "open",
            ControlOp::Close { .. } => "close",
            ControlOp::Sync { .. } => "sync",
            ControlOp::Exit => "exit",
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A control operation tagged with the session's next sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sequence: u32,
    pub op: ControlOp,
}

// ── Notifications ────────────────────────────────────────────────

/// State of one stream on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub name: String,
    /// Opened by the host.
    pub open: bool,
    /// Currently emitting (at least one matched reader).
    pub streaming: bool,
}

/// The device's current stream/state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub streams: Vec<StreamStatus>,
}

impl DeviceSnapshot {
    pub fn stream(&self, name: &str) -> Option<&StreamStatus> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// Reply to [`ControlOp::Sync`], all times on the device clock except `t0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReply {
    /// Control writer the request came from.
    pub requester: Guid,
    pub iteration: u64,
    /// Echo of the host send time.
    pub t0: Nanos,
    /// Device receive time.
    pub t1: Nanos,
    /// Device reply time.
    pub t2: Nanos,
}

/// Device → host message.
///
/// `State` is shared by every session on the device. `Ack` and `SyncReply`
/// name the control writer they answer, since sequence numbers are only
/// unique per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    State(DeviceSnapshot),
    Ack {
        requester: Guid,
        sequence: u32,
        error: Option<String>,
    },
    SyncReply(SyncReply),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::codec;

    #[test]
    fn topic_names() {
        assert_eq!(control_topic("cam/123"), "cam/123/control");
        assert_eq!(notification_topic("cam/123"), "cam/123/notification");
        assert_eq!(stream_topic("cam/123", "depth"), "cam/123/depth");
    }

    #[test]
    fn stream_mask_selects_kinds() {
        assert_eq!(StreamKind::from_mask(0x2), vec![StreamKind::Depth]);
        assert_eq!(
            StreamKind::from_mask(0x1 | 0x8),
            vec![StreamKind::Color, StreamKind::Imu]
        );
        assert!(StreamKind::from_mask(0).is_empty());
    }

    #[test]
    fn control_message_survives_codec() {
        let msg = ControlMessage {
            sequence: 7,
            op: ControlOp::Sync { iteration: 3, t0: -42 },
        };
        let bytes = codec::encode(&msg).unwrap();
        assert_eq!(codec::decode::<ControlMessage>(&bytes).unwrap(), msg);
        assert_eq!(msg.op.to_string(), "sync");
    }

    #[test]
    fn snapshot_lookup() {
        let snap = DeviceSnapshot {
            streams: vec![StreamStatus {
                name: "depth".into(),
                open: true,
                streaming: false,
            }],
        };
        assert!(snap.stream("depth").unwrap().open);
        assert!(snap.stream("rgb").is_none());
    }
}
