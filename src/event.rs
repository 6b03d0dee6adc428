//! Event handling system for HID host notifications.
//!
//! This module provides the event infrastructure for reporting connection
//! changes, decoded key presses, raw input reports and control channel
//! responses to the rest of the service.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::{
   bluetooth::transport::Packet,
   hid::{
      keyboard::KeyOutput,
      protocol::{MessageType, RequestKind},
      registry::ConnectionId,
   },
};

/// Events that can be emitted by the HID host.
#[derive(Debug, Clone)]
pub enum HidHostEvent {
   /// Both channels are open.
   ConnectionOpened { id: ConnectionId, address: Address },
   /// The last channel of a connection closed and its record was released.
   ConnectionClosed { id: ConnectionId, address: Address },
   ConnectionFailed { address: Address, status: u8 },
   DiscoveryFailed { address: Address, reason: SmolStr },
   /// Raw interrupt channel payload, including the header byte.
   InputReport { id: ConnectionId, data: Packet },
   Key { id: ConnectionId, output: KeyOutput },
   /// Reply to the outstanding control request.
   ControlResponse {
      id: ConnectionId,
      request: RequestKind,
      message_type: MessageType,
      param: u8,
      payload: Packet,
   },
   VirtualCableUnplug { id: ConnectionId },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: HidHostEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
