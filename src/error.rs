//! Error types for the HID host service.
//!
//! This module defines all error types that can occur while driving HID
//! devices: protocol-level rejections from the host state machine, transport
//! and discovery failures, plus the Bluetooth, D-Bus, I/O and configuration
//! errors of the surrounding daemon.

use bluer::Address;
use thiserror::Error;

use crate::{bluetooth::transport::Endpoint, hid::sdp::SdpError};

/// Main error type for the HID host service.
#[derive(Error, Debug)]
pub enum HidHostError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   /// No connection record, or the channel the operation needs is not open.
   #[error("Unknown connection identifier")]
   UnknownConnection,

   /// A request is already outstanding on the control channel.
   #[error("Command disallowed in current state")]
   CommandDisallowed,

   /// The transport rejected an open or a send.
   #[error("Transport failure: status 0x{0:02x}")]
   TransportFailure(u8),

   #[error("SDP attribute value buffer size exceeded: available {available}, required {required}")]
   AttributeBufferExceeded { available: usize, required: usize },

   #[error("HID {0} PSM missing")]
   DiscoveryIncomplete(Endpoint),

   #[error("SDP error: {0}")]
   Sdp(#[from] SdpError),

   #[error("A service discovery query is already running")]
   DiscoveryInProgress,

   #[error("No free connection slot for {0}")]
   RegistryFull(Address),

   #[error("Device {0} is virtually unplugged")]
   DeviceUnplugged(Address),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `HidHostError`.
pub type Result<T> = std::result::Result<T, HidHostError>;
