//! # camlink-core
//!
//! Device orchestration and remote discovery for camera/sensor hardware.
//!
//! This crate contains:
//! - **Context**: `Context` merging every device factory into one
//!   change-notified catalog, plus user-injected devices
//! - **Registry**: `ModuleRegistry` of statically registered `ContextModule`s
//! - **Factories**: `DeviceFactory` trait, local backend factory over a `DeviceWatcher`
//! - **Bus**: in-process publish/subscribe transport with per-sample timestamps
//! - **Remote**: discovery (`BusModule`), sessions (`RemoteDevice`) and the
//!   device side (`DeviceServer`, `StreamWriter`)
//! - **Sync**: four-timestamp clock offset estimation
//! - **Stats**: per-stream loss/latency accounting
//! - **Error**: `CamlinkError`, typed, `thiserror`-based error taxonomy

pub mod bus;
pub mod context;
pub mod device;
pub mod error;
pub mod factory;
pub mod mask;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod signal;
pub mod stats;
pub mod sync;
pub mod task;
pub mod time;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bus::{DomainId, Guid, MAX_DOMAIN_ID, Participant, Qos};
pub use context::{Context, ContextBuilder};
pub use device::{DeviceInfo, DeviceOrigin, DeviceRef, DevicesChangedCallback, RemoteDeviceHandle};
pub use error::{CamlinkError, Result};
pub use factory::{BackendDevice, BackendDeviceFactory, DeviceFactory, DeviceWatcher, SimulatedBackend};
pub use mask::{ProductLine, combine_masks, parse_mask};
pub use protocol::{
    ControlOp, DeviceAnnouncement, DeviceSnapshot, Frame, Notification, StreamKind, StreamProfile,
};
pub use registry::{ContextModule, ModuleRegistration, ModuleRegistry};
pub use remote::{
    BusDeviceFactory, BusModule, DeviceBroadcaster, DeviceServer, RemoteDevice, StreamConsumer,
    StreamWriter,
};
pub use signal::{ChangeSignal, Subscription};
pub use stats::StreamStats;
pub use sync::{OffsetEstimator, OffsetStats, SyncSample, run_clock_sync};
pub use time::{Clock, ClockRef, ManualClock, Nanos, OffsetClock, SystemClock};
pub use task::Worker;
