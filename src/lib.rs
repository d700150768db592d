//! A single-device USB/IP server.
//!
//! The bridge exports one USB device over one TCP connection. A session
//! reads USB/IP commands off the socket and hands them to a device executor
//! over two bounded channels: one for control commands (device list, import)
//! and one for URB submits. Replies from either side go through a shared
//! [SocketGuard] so frames never interleave.
//!
//! [HostExecutor] is the executor used by the binary; it forwards transfers
//! to a device of the host through libusb. Anything implementing
//! [DeviceExecutor] and draining [ExecutorPorts] can take its place.
use log::*;
use std::sync::Arc;

pub mod config;
pub mod consts;
pub mod device;
pub mod diag;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod guard;
pub mod host;
pub mod server;
pub mod session;
pub mod setup;
pub mod usbip_protocol;

pub use config::{DetachPolicy, DispatchConfig, KeepaliveConfig, ServerConfig, USBIP_PORT};
pub use device::{DeviceState, ExportedDevice, ExportedInterface};
pub use dispatch::{DispatchBridge, ExecutorPorts};
pub use error::{DispatchError, Error, WireError};
pub use executor::DeviceExecutor;
pub use guard::SocketGuard;
pub use host::HostExecutor;
pub use server::{HostNetwork, NetworkLink, UsbIpServer};
pub use session::{Phase, SessionEnd};
