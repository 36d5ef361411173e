//! Devices reachable over the publish/subscribe bus.
//!
//! Device side: [`DeviceServer`] (control handling, [`StreamWriter`]s,
//! [`DeviceBroadcaster`]). Host side: [`BusModule`] → [`BusDeviceFactory`]
//! → [`BusDeviceWatcher`] for discovery, [`RemoteDevice`] for sessions and
//! [`StreamConsumer`] for frame accounting.

mod broadcaster;
mod device;
mod module;
mod server;
mod stream;
mod watcher;

pub use broadcaster::DeviceBroadcaster;
pub use device::{DEFAULT_COMMAND_TIMEOUT, RemoteDevice};
pub use module::{BUS_MODULE_NAME, BusModule, BusSettings};
pub use server::DeviceServer;
pub use stream::{DEFAULT_FRAME_INTERVAL, FRAME_PAYLOAD_SIZE, StreamConsumer, StreamWriter};
pub use watcher::{BusDeviceFactory, BusDeviceWatcher, device_address};
