//! Boundary between the HID host core and the layers below it.
//!
//! The core never performs I/O itself. It calls into a [`Transport`] for
//! channel management and into a [`Discovery`] client for SDP queries; both
//! answer asynchronously by posting [`HostEvent`]s back to the dispatcher.

use bluer::Address;
use smallvec::SmallVec;

use crate::error::Result;

pub type Packet = SmallVec<[u8; 32]>;

/// Local channel identifier.
pub type Cid = u16;
/// Lower-layer ACL connection handle.
pub type LinkHandle = u16;

/// Maximum transmission unit for L2CAP packets
pub const L2CAP_MTU: usize = 672;

pub const PSM_SDP: u16 = 0x0001;
pub const PSM_HID_CONTROL: u16 = 0x0011;
pub const PSM_HID_INTERRUPT: u16 = 0x0013;

/// Status codes carried by channel and query notifications.
pub mod status {
   pub const SUCCESS: u8 = 0x00;
   pub const UNKNOWN_CONNECTION: u8 = 0x02;
   pub const MEMORY_CAPACITY_EXCEEDED: u8 = 0x07;
   pub const CONNECTION_TIMEOUT: u8 = 0x08;
   pub const CONNECTION_REJECTED: u8 = 0x0D;
   pub const UNSPECIFIED: u8 = 0x1F;

   pub fn from_io(err: &std::io::Error) -> u8 {
      match err.kind() {
         std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::PermissionDenied => {
            CONNECTION_REJECTED
         },
         std::io::ErrorKind::TimedOut => CONNECTION_TIMEOUT,
         std::io::ErrorKind::NotConnected => UNKNOWN_CONNECTION,
         _ => UNSPECIFIED,
      }
   }
}

/// The two HID channels of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Endpoint {
   Control,
   Interrupt,
}

/// Notifications delivered to the host, in arrival order.
#[derive(Debug, Clone)]
pub enum HostEvent {
   /// A remote device asks to open a channel; answer with accept or decline.
   IncomingConnection {
      cid: Cid,
      address: Address,
      psm: u16,
      link_handle: LinkHandle,
   },
   /// Result of an outgoing open, or completion of an accepted incoming one.
   ChannelOpened {
      cid: Cid,
      address: Address,
      psm: u16,
      status: u8,
      incoming: bool,
   },
   ChannelClosed {
      cid: Cid,
   },
   /// The channel can take one more outgoing packet.
   CanSendNow {
      cid: Cid,
   },
   Data {
      cid: Cid,
      data: Packet,
   },
   /// One byte of an attribute value returned by a discovery query.
   SdpAttributeByte {
      attribute_id: u16,
      offset: u16,
      value: u8,
      total_len: u16,
   },
   SdpQueryComplete {
      status: u8,
   },
}

/// Connection-oriented channel layer.
///
/// All methods return immediately; outcomes arrive later as [`HostEvent`]s.
pub trait Transport {
   /// Starts opening a channel and returns its local id. A `ChannelOpened`
   /// notification follows with the result.
   fn create_channel(&mut self, address: Address, psm: u16) -> Result<Cid>;

   fn accept(&mut self, cid: Cid);

   fn decline(&mut self, cid: Cid);

   /// Queues one packet. The caller keeps packets within the channel MTU.
   fn send(&mut self, cid: Cid, data: &[u8]) -> Result<()>;

   /// Asks for a single `CanSendNow` notification on `cid`.
   fn request_can_send_now(&mut self, cid: Cid);

   fn disconnect(&mut self, cid: Cid);
}

/// Service discovery client.
pub trait Discovery {
   /// Starts a service search attribute query for `service_class` on `address`.
   /// Results arrive as `SdpAttributeByte` notifications followed by one
   /// `SdpQueryComplete`.
   fn query(&mut self, address: Address, service_class: u16) -> Result<()>;
}
