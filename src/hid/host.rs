//! HID host core.
//!
//! [`HidHost`] owns the connection records and drives the per-connection
//! protocol state machine. It is fed [`HostEvent`]s in arrival order by a
//! single caller and never blocks: requests are parked in a want-to-send
//! state until the transport reports the control channel writable, and
//! exactly one message goes out per writable notification.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use log::{debug, error, info, warn};
use serde::Serialize;
use smol_str::{SmolStr, format_smolstr};

use crate::{
   bluetooth::transport::{
      Cid, Discovery, Endpoint, HostEvent, L2CAP_MTU, LinkHandle, PSM_HID_CONTROL,
      PSM_HID_INTERRUPT, Packet, Transport, status,
   },
   error::{HidHostError, Result},
   event::{EventSender, HidHostEvent},
   hid::{
      descriptor::ReportDescriptor,
      keyboard::ReportDecoder,
      protocol::{
         ControlOperation, HandshakeResult, MessageType, PendingRequest, ProtocolMode, ReportType,
         RequestKind, decode_control_header, encode_control_operation,
      },
      registry::{ConnectionId, ConnectionRegistry},
      sdp::{SERVICE_CLASS_HID, SdpQuery},
   },
};

/// Protocol state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
   /// Control channel not open.
   Idle,
   ControlEstablished,
   /// Waiting for the control channel to become writable.
   WantToSend(PendingRequest),
   /// Request sent, waiting for the device's reply.
   AwaitingResponse(RequestKind),
}

impl HostState {
   pub const fn name(&self) -> &'static str {
      match self {
         Self::Idle => "IDLE",
         Self::ControlEstablished => "CONTROL_ESTABLISHED",
         Self::WantToSend(request) => match request.kind() {
            RequestKind::GetReport => "W2_GET_REPORT",
            RequestKind::SetReport => "W2_SET_REPORT",
            RequestKind::GetProtocol => "W2_GET_PROTOCOL",
            RequestKind::SetProtocol => "W2_SET_PROTOCOL",
         },
         Self::AwaitingResponse(kind) => match kind {
            RequestKind::GetReport => "W4_GET_REPORT",
            RequestKind::SetReport => "W4_SET_REPORT",
            RequestKind::GetProtocol => "W4_GET_PROTOCOL",
            RequestKind::SetProtocol => "W4_SET_PROTOCOL",
         },
      }
   }
}

/// Everything the host knows about one device.
#[derive(Debug)]
pub struct HidHostConnection {
   pub connection_id: ConnectionId,
   pub address: Address,
   pub link_handle: Option<LinkHandle>,
   pub control_cid: Option<Cid>,
   pub interrupt_cid: Option<Cid>,
   /// Set by a virtual cable unplug; blocks new channels until cleared.
   pub unplugged: bool,
   pub state: HostState,
   /// Interrupt channel is open, not just pending.
   interrupt_open: bool,
   decoder: ReportDecoder,
}

impl HidHostConnection {
   pub fn new(connection_id: ConnectionId, address: Address) -> Self {
      Self {
         connection_id,
         address,
         link_handle: None,
         control_cid: None,
         interrupt_cid: None,
         unplugged: false,
         state: HostState::Idle,
         interrupt_open: false,
         decoder: ReportDecoder::boot_keyboard(),
      }
   }

   pub fn owns_channel(&self, cid: Cid) -> bool {
      self.control_cid == Some(cid) || self.interrupt_cid == Some(cid)
   }

   pub fn endpoint_of(&self, cid: Cid) -> Option<Endpoint> {
      if self.control_cid == Some(cid) {
         Some(Endpoint::Control)
      } else if self.interrupt_cid == Some(cid) {
         Some(Endpoint::Interrupt)
      } else {
         None
      }
   }

   pub const fn channel(&self, endpoint: Endpoint) -> Option<Cid> {
      match endpoint {
         Endpoint::Control => self.control_cid,
         Endpoint::Interrupt => self.interrupt_cid,
      }
   }

   const fn channel_mut(&mut self, endpoint: Endpoint) -> &mut Option<Cid> {
      match endpoint {
         Endpoint::Control => &mut self.control_cid,
         Endpoint::Interrupt => &mut self.interrupt_cid,
      }
   }

   /// True once neither channel is open or pending.
   pub const fn is_closed(&self) -> bool {
      self.control_cid.is_none() && self.interrupt_cid.is_none()
   }

   pub fn set_descriptor(&mut self, descriptor: Arc<ReportDescriptor>) {
      self.decoder.set_descriptor(descriptor);
   }

   pub fn info(&self) -> ConnectionInfo {
      ConnectionInfo {
         id: self.connection_id.get(),
         address: self.address.to_string(),
         state: self.state.name(),
         control_cid: self.control_cid,
         interrupt_cid: self.interrupt_cid,
         unplugged: self.unplugged,
      }
   }
}

/// Snapshot of a connection for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
   pub id: u16,
   pub address: String,
   pub state: &'static str,
   pub control_cid: Option<Cid>,
   pub interrupt_cid: Option<Cid>,
   pub unplugged: bool,
}

/// Result of the last successful discovery for a device.
#[derive(Debug, Clone)]
struct DeviceProfile {
   control_psm: u16,
   interrupt_psm: u16,
   descriptor: Option<Arc<ReportDescriptor>>,
}

/// The HID host: connection registry, protocol state machine and event dispatcher.
pub struct HidHost<T, D> {
   transport: T,
   discovery: D,
   events: EventSender,
   registry: ConnectionRegistry,
   profiles: HashMap<Address, DeviceProfile>,
   query: Option<SdpQuery>,
   listen: bool,
}

impl<T: Transport, D: Discovery> HidHost<T, D> {
   pub fn new(transport: T, discovery: D, events: EventSender, max_connections: usize) -> Self {
      Self {
         transport,
         discovery,
         events,
         registry: ConnectionRegistry::new(max_connections),
         profiles: HashMap::new(),
         query: None,
         listen: true,
      }
   }

   /// Whether device-initiated channels are accepted.
   pub const fn set_listen(&mut self, listen: bool) {
      self.listen = listen;
   }

   /// Whether a discovery query is running.
   pub const fn is_discovering(&self) -> bool {
      self.query.is_some()
   }

   pub fn connections(&self) -> Vec<ConnectionInfo> {
      self.registry.iter().map(HidHostConnection::info).collect()
   }

   /// Single entry point for transport and discovery notifications.
   pub fn handle_event(&mut self, event: HostEvent) {
      match event {
         HostEvent::IncomingConnection {
            cid,
            address,
            psm,
            link_handle,
         } => self.on_incoming_connection(cid, address, psm, link_handle),
         HostEvent::ChannelOpened {
            cid,
            address,
            psm,
            status,
            incoming,
         } => self.on_channel_opened(cid, address, psm, status, incoming),
         HostEvent::ChannelClosed { cid } => self.on_channel_closed(cid),
         HostEvent::CanSendNow { cid } => self.on_can_send_now(cid),
         HostEvent::Data { cid, data } => self.on_data(cid, data),
         HostEvent::SdpAttributeByte {
            attribute_id,
            offset,
            value,
            total_len,
         } => self.on_sdp_attribute_byte(attribute_id, offset, value, total_len),
         HostEvent::SdpQueryComplete { status } => self.on_sdp_query_complete(status),
      }
   }

   // === Outgoing connections ===

   /// Looks up the HID service of `address` and connects to it.
   pub fn connect(&mut self, address: Address) -> Result<()> {
      if self.registry.is_unplugged(address) {
         return Err(HidHostError::DeviceUnplugged(address));
      }
      if self.query.is_some() {
         return Err(HidHostError::DiscoveryInProgress);
      }
      if let Some(conn) = self.registry.find_by_address(address)
         && conn.control_cid.is_some()
      {
         return Err(HidHostError::CommandDisallowed);
      }

      info!("Start SDP HID query for {address}");
      self.discovery.query(address, SERVICE_CLASS_HID)?;
      self.query = Some(SdpQuery::new(address));
      Ok(())
   }

   /// Opens the control channel without a discovery round.
   pub fn reconnect_control(&mut self, address: Address) -> Result<()> {
      self.open_channel(address, Endpoint::Control)
   }

   /// Opens the interrupt channel without a discovery round.
   pub fn reconnect_interrupt(&mut self, address: Address) -> Result<()> {
      self.open_channel(address, Endpoint::Interrupt)
   }

   fn psm_for(&self, address: Address, endpoint: Endpoint) -> u16 {
      let profile = self.profiles.get(&address);
      match endpoint {
         Endpoint::Control => profile.map_or(PSM_HID_CONTROL, |p| p.control_psm),
         Endpoint::Interrupt => profile.map_or(PSM_HID_INTERRUPT, |p| p.interrupt_psm),
      }
   }

   fn open_channel(&mut self, address: Address, endpoint: Endpoint) -> Result<()> {
      if self.registry.is_unplugged(address) {
         return Err(HidHostError::DeviceUnplugged(address));
      }

      let psm = self.psm_for(address, endpoint);
      let descriptor = self
         .profiles
         .get(&address)
         .and_then(|p| p.descriptor.clone());

      let conn = self.registry.get_or_create(address)?;
      if conn.channel(endpoint).is_some() {
         return Err(HidHostError::CommandDisallowed);
      }
      if let Some(descriptor) = descriptor {
         conn.set_descriptor(descriptor);
      }

      info!("Connecting to HID {endpoint} of {address} (PSM 0x{psm:04x})");
      match self.transport.create_channel(address, psm) {
         Ok(cid) => {
            *conn.channel_mut(endpoint) = Some(cid);
            Ok(())
         },
         Err(e) => {
            warn!("Connecting to HID {endpoint} failed: {e}");
            if conn.is_closed() {
               let id = conn.connection_id;
               self.registry.release(id);
            }
            Err(e)
         },
      }
   }

   // === Control requests ===

   pub fn request_get_report(
      &mut self,
      id: ConnectionId,
      report_type: ReportType,
      report_id: u8,
   ) -> Result<()> {
      self.submit(id, PendingRequest::GetReport {
         report_type,
         report_id,
      })
   }

   pub fn request_set_report(
      &mut self,
      id: ConnectionId,
      report_type: ReportType,
      report_id: u8,
      payload: &[u8],
   ) -> Result<()> {
      // Header and report id go out in front of the payload
      if payload.len() + 2 > L2CAP_MTU {
         return Err(HidHostError::InvalidArgument(format!(
            "SET_REPORT payload of {} bytes exceeds the {L2CAP_MTU} byte MTU",
            payload.len()
         )));
      }
      self.submit(id, PendingRequest::SetReport {
         report_type,
         report_id,
         payload: Packet::from_slice(payload),
      })
   }

   pub fn request_get_protocol(&mut self, id: ConnectionId) -> Result<()> {
      self.submit(id, PendingRequest::GetProtocol)
   }

   pub fn request_set_protocol(&mut self, id: ConnectionId, mode: ProtocolMode) -> Result<()> {
      self.submit(id, PendingRequest::SetProtocol(mode))
   }

   pub fn get_input_report(&mut self, id: ConnectionId, report_id: u8) -> Result<()> {
      self.request_get_report(id, ReportType::Input, report_id)
   }

   pub fn get_output_report(&mut self, id: ConnectionId, report_id: u8) -> Result<()> {
      self.request_get_report(id, ReportType::Output, report_id)
   }

   pub fn get_feature_report(&mut self, id: ConnectionId, report_id: u8) -> Result<()> {
      self.request_get_report(id, ReportType::Feature, report_id)
   }

   pub fn set_input_report(&mut self, id: ConnectionId, report_id: u8, payload: &[u8]) -> Result<()> {
      self.request_set_report(id, ReportType::Input, report_id, payload)
   }

   pub fn set_output_report(
      &mut self,
      id: ConnectionId,
      report_id: u8,
      payload: &[u8],
   ) -> Result<()> {
      self.request_set_report(id, ReportType::Output, report_id, payload)
   }

   pub fn set_feature_report(
      &mut self,
      id: ConnectionId,
      report_id: u8,
      payload: &[u8],
   ) -> Result<()> {
      self.request_set_report(id, ReportType::Feature, report_id, payload)
   }

   fn submit(&mut self, id: ConnectionId, request: PendingRequest) -> Result<()> {
      let conn = self
         .registry
         .find_by_connection_id(id)
         .ok_or(HidHostError::UnknownConnection)?;
      let cid = conn.control_cid.ok_or(HidHostError::UnknownConnection)?;
      if conn.state != HostState::ControlEstablished {
         debug!(
            "{}: {} rejected in state {}",
            conn.address,
            request.kind(),
            conn.state.name()
         );
         return Err(HidHostError::CommandDisallowed);
      }

      conn.state = HostState::WantToSend(request);
      debug!("{}: state {}", conn.address, conn.state.name());
      self.transport.request_can_send_now(cid);
      Ok(())
   }

   pub fn send_suspend(&mut self, id: ConnectionId) -> Result<()> {
      self.send_control_operation(id, ControlOperation::Suspend)
   }

   pub fn send_exit_suspend(&mut self, id: ConnectionId) -> Result<()> {
      self.send_control_operation(id, ControlOperation::ExitSuspend)
   }

   /// Unplugs the device; it stays unplugged until [`Self::clear_unplugged`].
   pub fn send_virtual_cable_unplug(&mut self, id: ConnectionId) -> Result<()> {
      self.send_control_operation(id, ControlOperation::VirtualCableUnplug)
   }

   fn send_control_operation(&mut self, id: ConnectionId, op: ControlOperation) -> Result<()> {
      let conn = self
         .registry
         .find_by_connection_id(id)
         .ok_or(HidHostError::UnknownConnection)?;
      let cid = conn.control_cid.ok_or(HidHostError::UnknownConnection)?;

      info!("{}: sending {op}", conn.address);
      self.transport.send(cid, &encode_control_operation(op))?;
      if op == ControlOperation::VirtualCableUnplug {
         conn.unplugged = true;
      }
      Ok(())
   }

   pub fn clear_unplugged(&mut self, address: Address) -> bool {
      self.registry.clear_unplugged(address)
   }

   // === Disconnection ===

   pub fn disconnect_control(&mut self, id: ConnectionId) -> Result<()> {
      self.disconnect_endpoint(id, Endpoint::Control)
   }

   pub fn disconnect_interrupt(&mut self, id: ConnectionId) -> Result<()> {
      self.disconnect_endpoint(id, Endpoint::Interrupt)
   }

   /// Closes the interrupt channel, then the control channel.
   pub fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
      let conn = self
         .registry
         .find_by_connection_id(id)
         .ok_or(HidHostError::UnknownConnection)?;
      for cid in [conn.interrupt_cid, conn.control_cid].into_iter().flatten() {
         self.transport.disconnect(cid);
      }
      Ok(())
   }

   fn disconnect_endpoint(&mut self, id: ConnectionId, endpoint: Endpoint) -> Result<()> {
      let conn = self
         .registry
         .find_by_connection_id(id)
         .ok_or(HidHostError::UnknownConnection)?;
      let cid = conn
         .channel(endpoint)
         .ok_or(HidHostError::UnknownConnection)?;
      info!("{}: disconnecting HID {endpoint}", conn.address);
      self.transport.disconnect(cid);
      Ok(())
   }

   // === Notifications ===

   fn on_incoming_connection(
      &mut self,
      cid: Cid,
      address: Address,
      psm: u16,
      link_handle: LinkHandle,
   ) {
      let endpoint = match psm {
         PSM_HID_CONTROL => Endpoint::Control,
         PSM_HID_INTERRUPT => Endpoint::Interrupt,
         _ => {
            info!("Declining connection from {address} on PSM 0x{psm:04x}");
            self.transport.decline(cid);
            return;
         },
      };
      if !self.listen {
         info!("Declining HID {endpoint} from {address}, not listening");
         self.transport.decline(cid);
         return;
      }

      if self.registry.is_unplugged(address) {
         info!("Declining HID {endpoint} from {address}, host is unplugged");
         self.transport.decline(cid);
         return;
      }

      let descriptor = self
         .profiles
         .get(&address)
         .and_then(|p| p.descriptor.clone());
      let conn = match self.registry.get_or_create(address) {
         Ok(conn) => conn,
         Err(e) => {
            error!("Cannot create connection record for {address}: {e}");
            self.transport.decline(cid);
            return;
         },
      };

      if conn.link_handle.is_some_and(|h| h != link_handle) {
         info!("Declining HID {endpoint} from {address}, link handle mismatch");
         self.transport.decline(cid);
         return;
      }
      if conn.channel(endpoint).is_some() {
         info!("Declining HID {endpoint} from {address}, channel already open");
         self.transport.decline(cid);
         return;
      }

      conn.link_handle = Some(link_handle);
      *conn.channel_mut(endpoint) = Some(cid);
      if let Some(descriptor) = descriptor {
         conn.set_descriptor(descriptor);
      }
      info!("Accepting HID {endpoint} from {address} (cid 0x{cid:04x})");
      self.transport.accept(cid);
   }

   fn on_channel_opened(&mut self, cid: Cid, address: Address, psm: u16, status: u8, incoming: bool) {
      let Some(conn) = self.registry.find_by_channel_id(cid) else {
         debug!("Channel 0x{cid:04x} to {address} opened for no connection");
         return;
      };
      let Some(endpoint) = conn.endpoint_of(cid) else {
         return;
      };

      if status != status::SUCCESS {
         warn!("L2CAP connection to {address} (PSM 0x{psm:04x}) failed: 0x{status:02x}");
         *conn.channel_mut(endpoint) = None;
         match endpoint {
            Endpoint::Control => conn.state = HostState::Idle,
            Endpoint::Interrupt => conn.interrupt_open = false,
         }
         if conn.is_closed() {
            let id = conn.connection_id;
            self.registry.release(id);
         }
         self.events.emit(HidHostEvent::ConnectionFailed { address, status });
         return;
      }

      match endpoint {
         Endpoint::Control => {
            info!("{address}: HID Control open (cid 0x{cid:04x})");
            if incoming || conn.interrupt_cid.is_some() {
               conn.state = HostState::ControlEstablished;
               if conn.interrupt_open {
                  info!("{address}: HID connection established");
                  let id = conn.connection_id;
                  self.events.emit(HidHostEvent::ConnectionOpened { id, address });
               }
               return;
            }
            let interrupt_psm = self
               .profiles
               .get(&address)
               .map_or(PSM_HID_INTERRUPT, |p| p.interrupt_psm);
            match self.transport.create_channel(conn.address, interrupt_psm) {
               Ok(interrupt_cid) => {
                  conn.interrupt_cid = Some(interrupt_cid);
                  conn.state = HostState::ControlEstablished;
               },
               Err(e) => {
                  warn!("Connecting to HID Interrupt failed: {e}");
                  self.transport.disconnect(cid);
                  self.events.emit(HidHostEvent::ConnectionFailed {
                     address,
                     status: failure_status(&e),
                  });
               },
            }
         },
         Endpoint::Interrupt => {
            conn.interrupt_open = true;
            conn.decoder.reset();
            if conn.control_cid.is_none() || conn.state == HostState::Idle {
               info!("{address}: HID Interrupt open, waiting for HID Control");
               return;
            }
            info!("{address}: HID connection established");
            let id = conn.connection_id;
            self.events.emit(HidHostEvent::ConnectionOpened { id, address });
         },
      }
   }

   fn on_channel_closed(&mut self, cid: Cid) {
      let Some(conn) = self.registry.find_by_channel_id(cid) else {
         return;
      };
      let Some(endpoint) = conn.endpoint_of(cid) else {
         return;
      };

      info!("{}: HID {endpoint} closed", conn.address);
      *conn.channel_mut(endpoint) = None;
      match endpoint {
         Endpoint::Control => conn.state = HostState::Idle,
         Endpoint::Interrupt => {
            conn.interrupt_open = false;
            conn.decoder.reset();
         },
      }

      if conn.is_closed() {
         let (id, address) = (conn.connection_id, conn.address);
         self.registry.release(id);
         self.events.emit(HidHostEvent::ConnectionClosed { id, address });
      }
   }

   fn on_can_send_now(&mut self, cid: Cid) {
      let Some(conn) = self.registry.find_by_channel_id(cid) else {
         return;
      };
      if conn.control_cid != Some(cid) {
         return;
      }
      let HostState::WantToSend(request) = &conn.state else {
         debug!("{}: can send now in state {}", conn.address, conn.state.name());
         return;
      };

      let packet = request.encode();
      let kind = request.kind();
      conn.state = HostState::AwaitingResponse(kind);
      if let Err(e) = self.transport.send(cid, &packet) {
         warn!("{}: failed to send request: {e}", conn.address);
         conn.state = HostState::ControlEstablished;
      }
   }

   fn on_data(&mut self, cid: Cid, data: Packet) {
      let Some(conn) = self.registry.find_by_channel_id(cid) else {
         error!("No host for cid 0x{cid:04x}");
         return;
      };
      let id = conn.connection_id;

      if conn.interrupt_cid == Some(cid) {
         debug!("HID Interrupt data: {}", hex::encode(&data));
         let keys = conn.decoder.decode(&data);
         self.events.emit(HidHostEvent::InputReport { id, data });
         for output in keys {
            self.events.emit(HidHostEvent::Key { id, output });
         }
         return;
      }

      let Some((&first, payload)) = data.split_first() else {
         return;
      };
      let header = decode_control_header(first);
      debug!(
         "HID Control data {header} in state {}: {}",
         conn.state.name(),
         hex::encode(&data)
      );

      match header.message_type() {
         Some(MessageType::HidControl) => {
            if header.control_operation() == Some(ControlOperation::VirtualCableUnplug) {
               info!("{}: virtual cable unplug", conn.address);
               conn.unplugged = true;
               self.events.emit(HidHostEvent::VirtualCableUnplug { id });
            }
         },
         Some(message_type @ (MessageType::Data | MessageType::Handshake)) => {
            let HostState::AwaitingResponse(request) = conn.state else {
               debug!("{}: unsolicited {header}", conn.address);
               return;
            };
            if message_type == MessageType::Handshake
               && header.handshake_result() != Some(HandshakeResult::Successful)
            {
               let result = header
                  .handshake_result()
                  .map_or_else(|| format_smolstr!("0x{:x}", header.param), |r| format_smolstr!("{r}"));
               warn!("{}: {request} answered with handshake {result}", conn.address);
            }
            conn.state = HostState::ControlEstablished;
            self.events.emit(HidHostEvent::ControlResponse {
               id,
               request,
               message_type,
               param: header.param,
               payload: Packet::from_slice(payload),
            });
         },
         _ => {},
      }
   }

   // === Discovery ===

   fn on_sdp_attribute_byte(&mut self, attribute_id: u16, offset: u16, value: u8, total_len: u16) {
      let Some(query) = self.query.as_mut() else {
         return;
      };
      if let Err(e) = query.push_byte(attribute_id, offset, value, total_len)
         && offset == 0
      {
         error!("{}: attribute 0x{attribute_id:04x}: {e}", query.address());
      }
   }

   fn on_sdp_query_complete(&mut self, query_status: u8) {
      let Some(query) = self.query.take() else {
         return;
      };
      let address = query.address();

      if query_status != status::SUCCESS {
         warn!("SDP query for {address} failed: 0x{query_status:02x}");
         self.events.emit(HidHostEvent::DiscoveryFailed {
            address,
            reason: format_smolstr!("query status 0x{query_status:02x}"),
         });
         return;
      }

      let record = match query.finish() {
         Ok(record) => record,
         Err(e) => {
            warn!("{address}: {e}");
            self.events.emit(HidHostEvent::DiscoveryFailed {
               address,
               reason: SmolStr::new(e.to_string()),
            });
            return;
         },
      };

      let descriptor = record.descriptor.filter(|d| !d.is_empty());
      match &descriptor {
         Some(d) => info!(
            "{address}: HID descriptor of {} bytes, report ids: {}",
            d.as_bytes().len(),
            d.uses_report_ids()
         ),
         None => warn!("{address}: no usable HID descriptor, decoding as boot keyboard"),
      }
      self.profiles.insert(address, DeviceProfile {
         control_psm: record.control_psm,
         interrupt_psm: record.interrupt_psm,
         descriptor: descriptor.map(Arc::new),
      });

      info!("Setup HID for {address}");
      if let Err(e) = self.open_channel(address, Endpoint::Control) {
         self.events.emit(HidHostEvent::ConnectionFailed {
            address,
            status: failure_status(&e),
         });
      }
   }
}

/// Status reported upward for a failed channel creation.
fn failure_status(e: &HidHostError) -> u8 {
   match e {
      HidHostError::TransportFailure(status) => *status,
      _ => status::UNSPECIFIED,
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      event::EventBus,
      hid::{
         keyboard::KeyOutput,
         sdp::{ATTR_HID_DESCRIPTOR_LIST, ATTR_PROTOCOL_DESCRIPTOR_LIST},
      },
   };

   const DEVICE: Address = Address([0x00, 0x1B, 0xDC, 0x08, 0xE2, 0x5C]);
   const LINK: LinkHandle = 0x0b;

   #[derive(Debug, Clone, PartialEq, Eq)]
   enum Op {
      Create(Address, u16, Cid),
      Accept(Cid),
      Decline(Cid),
      Send(Cid, Vec<u8>),
      RequestCanSendNow(Cid),
      Disconnect(Cid),
      Query(Address, u16),
   }

   #[derive(Default)]
   struct Shared {
      ops: Mutex<Vec<Op>>,
      events: Mutex<Vec<HidHostEvent>>,
      fail_create: Mutex<bool>,
      next_cid: Mutex<Cid>,
   }

   impl Shared {
      fn take_ops(&self) -> Vec<Op> {
         std::mem::take(&mut *self.ops.lock())
      }

      fn take_events(&self) -> Vec<HidHostEvent> {
         std::mem::take(&mut *self.events.lock())
      }
   }

   struct MockTransport(Arc<Shared>);

   impl Transport for MockTransport {
      fn create_channel(&mut self, address: Address, psm: u16) -> Result<Cid> {
         if *self.0.fail_create.lock() {
            return Err(HidHostError::TransportFailure(status::CONNECTION_REJECTED));
         }
         let mut next = self.0.next_cid.lock();
         *next += 1;
         let cid = 0x40 + *next;
         self.0.ops.lock().push(Op::Create(address, psm, cid));
         Ok(cid)
      }

      fn accept(&mut self, cid: Cid) {
         self.0.ops.lock().push(Op::Accept(cid));
      }

      fn decline(&mut self, cid: Cid) {
         self.0.ops.lock().push(Op::Decline(cid));
      }

      fn send(&mut self, cid: Cid, data: &[u8]) -> Result<()> {
         self.0.ops.lock().push(Op::Send(cid, data.to_vec()));
         Ok(())
      }

      fn request_can_send_now(&mut self, cid: Cid) {
         self.0.ops.lock().push(Op::RequestCanSendNow(cid));
      }

      fn disconnect(&mut self, cid: Cid) {
         self.0.ops.lock().push(Op::Disconnect(cid));
      }
   }

   struct MockDiscovery(Arc<Shared>);

   impl Discovery for MockDiscovery {
      fn query(&mut self, address: Address, service_class: u16) -> Result<()> {
         self.0.ops.lock().push(Op::Query(address, service_class));
         Ok(())
      }
   }

   struct RecordingBus(Arc<Shared>);

   impl EventBus for RecordingBus {
      fn emit(&self, event: HidHostEvent) {
         self.0.events.lock().push(event);
      }
   }

   fn host() -> (HidHost<MockTransport, MockDiscovery>, Arc<Shared>) {
      let shared = Arc::new(Shared::default());
      let host = HidHost::new(
         MockTransport(shared.clone()),
         MockDiscovery(shared.clone()),
         Arc::new(RecordingBus(shared.clone())),
         1,
      );
      (host, shared)
   }

   fn opened(cid: Cid, psm: u16, incoming: bool) -> HostEvent {
      HostEvent::ChannelOpened {
         cid,
         address: DEVICE,
         psm,
         status: status::SUCCESS,
         incoming,
      }
   }

   fn data(cid: Cid, bytes: &[u8]) -> HostEvent {
      HostEvent::Data {
         cid,
         data: Packet::from_slice(bytes),
      }
   }

   /// Brings up a device-initiated connection with control cid 0x60 and
   /// interrupt cid 0x61.
   fn incoming(host: &mut HidHost<MockTransport, MockDiscovery>, shared: &Shared) -> ConnectionId {
      for (cid, psm) in [(0x60, PSM_HID_CONTROL), (0x61, PSM_HID_INTERRUPT)] {
         host.handle_event(HostEvent::IncomingConnection {
            cid,
            address: DEVICE,
            psm,
            link_handle: LINK,
         });
         host.handle_event(opened(cid, psm, true));
      }
      assert_eq!(shared.take_ops(), vec![Op::Accept(0x60), Op::Accept(0x61)]);
      match shared.take_events().as_slice() {
         [HidHostEvent::ConnectionOpened { id, address }] if *address == DEVICE => *id,
         other => panic!("unexpected events {other:?}"),
      }
   }

   fn state(host: &mut HidHost<MockTransport, MockDiscovery>, id: ConnectionId) -> HostState {
      host.registry.find_by_connection_id(id).unwrap().state.clone()
   }

   fn feed_attribute(host: &mut HidHost<MockTransport, MockDiscovery>, id: u16, value: &[u8]) {
      for (offset, &b) in value.iter().enumerate() {
         host.handle_event(HostEvent::SdpAttributeByte {
            attribute_id: id,
            offset: offset as u16,
            value: b,
            total_len: value.len() as u16,
         });
      }
   }

   #[test]
   fn test_incoming_connection_reaches_control_established() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);
      assert_eq!(state(&mut host, id), HostState::ControlEstablished);

      let info = host.connections();
      assert_eq!(info.len(), 1);
      assert_eq!(info[0].state, "CONTROL_ESTABLISHED");
      assert_eq!(info[0].control_cid, Some(0x60));
      assert_eq!(info[0].interrupt_cid, Some(0x61));
   }

   #[test]
   fn test_request_cycle_for_every_kind() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      let cases: [(fn(&mut HidHost<MockTransport, MockDiscovery>, ConnectionId) -> Result<()>, &str, &str, Vec<u8>); 4] = [
         (
            |h, id| h.get_feature_report(id, 0x05),
            "W2_GET_REPORT",
            "W4_GET_REPORT",
            vec![0x43, 0x05],
         ),
         (
            |h, id| h.set_output_report(id, 0x01, &[0x02]),
            "W2_SET_REPORT",
            "W4_SET_REPORT",
            vec![0x52, 0x01, 0x02],
         ),
         (
            |h, id| h.request_get_protocol(id),
            "W2_GET_PROTOCOL",
            "W4_GET_PROTOCOL",
            vec![0x60],
         ),
         (
            |h, id| h.request_set_protocol(id, ProtocolMode::Boot),
            "W2_SET_PROTOCOL",
            "W4_SET_PROTOCOL",
            vec![0x70],
         ),
      ];

      for (request, want_to_send, awaiting, wire) in cases {
         request(&mut host, id).unwrap();
         assert_eq!(state(&mut host, id).name(), want_to_send);
         assert_eq!(shared.take_ops(), vec![Op::RequestCanSendNow(0x60)]);

         host.handle_event(HostEvent::CanSendNow { cid: 0x60 });
         assert_eq!(state(&mut host, id).name(), awaiting);
         assert_eq!(shared.take_ops(), vec![Op::Send(0x60, wire)]);

         // A second writable notification sends nothing.
         host.handle_event(HostEvent::CanSendNow { cid: 0x60 });
         assert!(shared.take_ops().is_empty());

         host.handle_event(data(0x60, &[0xA3, 0x05, 0x01]));
         assert_eq!(state(&mut host, id), HostState::ControlEstablished);
         assert!(matches!(
            shared.take_events().as_slice(),
            [HidHostEvent::ControlResponse {
               message_type: MessageType::Data,
               param: 0x3,
               ..
            }]
         ));
      }
   }

   #[test]
   fn test_second_request_is_disallowed() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      host.get_input_report(id, 0x01).unwrap();
      let before = state(&mut host, id);
      assert!(matches!(
         host.request_set_protocol(id, ProtocolMode::Report),
         Err(HidHostError::CommandDisallowed)
      ));
      assert_eq!(state(&mut host, id), before);

      host.handle_event(HostEvent::CanSendNow { cid: 0x60 });
      assert!(matches!(
         host.request_get_protocol(id),
         Err(HidHostError::CommandDisallowed)
      ));
      assert_eq!(state(&mut host, id).name(), "W4_GET_REPORT");
   }

   #[test]
   fn test_requests_need_a_control_channel() {
      let (mut host, shared) = host();
      let missing = ConnectionId::new(7).unwrap();
      assert!(matches!(
         host.request_get_protocol(missing),
         Err(HidHostError::UnknownConnection)
      ));

      let id = incoming(&mut host, &shared);
      host.handle_event(HostEvent::ChannelClosed { cid: 0x60 });
      assert!(matches!(
         host.request_get_protocol(id),
         Err(HidHostError::UnknownConnection)
      ));
      assert!(matches!(
         host.send_suspend(id),
         Err(HidHostError::UnknownConnection)
      ));
   }

   #[test]
   fn test_handshake_completes_request() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);
      host.set_feature_report(id, 0x02, &[0xFF]).unwrap();
      host.handle_event(HostEvent::CanSendNow { cid: 0x60 });
      shared.take_ops();

      host.handle_event(data(0x60, &[0x03]));
      assert_eq!(state(&mut host, id), HostState::ControlEstablished);
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ControlResponse {
            request: RequestKind::SetReport,
            message_type: MessageType::Handshake,
            param: 0x3,
            ..
         }]
      ));
   }

   #[test]
   fn test_unsolicited_data_is_ignored() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);
      host.get_input_report(id, 0x01).unwrap();

      // Still waiting to send: the reply cannot be ours.
      host.handle_event(data(0x60, &[0xA1, 0x00]));
      assert_eq!(state(&mut host, id).name(), "W2_GET_REPORT");
      assert!(shared.take_events().is_empty());
   }

   #[test]
   fn test_virtual_cable_unplug_keeps_state() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      host.get_input_report(id, 0x01).unwrap();
      host.handle_event(HostEvent::CanSendNow { cid: 0x60 });
      host.handle_event(data(0x60, &[0x15]));

      let conn = host.registry.find_by_connection_id(id).unwrap();
      assert!(conn.unplugged);
      assert_eq!(conn.state.name(), "W4_GET_REPORT");
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::VirtualCableUnplug { .. }]
      ));
   }

   #[test]
   fn test_unplugged_device_is_declined() {
      let (mut host, shared) = host();
      incoming(&mut host, &shared);
      host.handle_event(data(0x60, &[0x15]));
      host.handle_event(HostEvent::ChannelClosed { cid: 0x61 });
      host.handle_event(HostEvent::ChannelClosed { cid: 0x60 });
      assert!(host.connections().is_empty());
      shared.take_events();

      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x70,
         address: DEVICE,
         psm: PSM_HID_CONTROL,
         link_handle: LINK,
      });
      assert_eq!(shared.take_ops(), vec![Op::Decline(0x70)]);
      assert!(matches!(
         host.connect(DEVICE),
         Err(HidHostError::DeviceUnplugged(_))
      ));
      assert!(matches!(
         host.reconnect_control(DEVICE),
         Err(HidHostError::DeviceUnplugged(_))
      ));

      assert!(host.clear_unplugged(DEVICE));
      host.reconnect_control(DEVICE).unwrap();
      assert_ne!(host.connections()[0].id, 0);
   }

   #[test]
   fn test_incoming_checks() {
      let (mut host, shared) = host();
      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x50,
         address: DEVICE,
         psm: 0x0003,
         link_handle: LINK,
      });
      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x51,
         address: DEVICE,
         psm: PSM_HID_CONTROL,
         link_handle: LINK,
      });
      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x52,
         address: DEVICE,
         psm: PSM_HID_INTERRUPT,
         link_handle: LINK + 1,
      });
      assert_eq!(shared.take_ops(), vec![
         Op::Decline(0x50),
         Op::Accept(0x51),
         Op::Decline(0x52)
      ]);

      // Single slot: a second device has nowhere to go.
      let other = Address([0x00, 0x1B, 0xDC, 0x08, 0xE2, 0x5D]);
      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x53,
         address: other,
         psm: PSM_HID_CONTROL,
         link_handle: LINK + 2,
      });
      assert_eq!(shared.take_ops(), vec![Op::Decline(0x53)]);
   }

   #[test]
   fn test_not_listening_declines() {
      let (mut host, shared) = host();
      host.set_listen(false);
      host.handle_event(HostEvent::IncomingConnection {
         cid: 0x51,
         address: DEVICE,
         psm: PSM_HID_CONTROL,
         link_handle: LINK,
      });
      assert_eq!(shared.take_ops(), vec![Op::Decline(0x51)]);
   }

   #[test]
   fn test_interrupt_reports_are_decoded() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      host.handle_event(data(0x61, &[0xA1, 0x02, 0x00, 0x04, 0, 0, 0, 0, 0]));
      host.handle_event(data(0x61, &[0xA1, 0x02, 0x00, 0x04, 0, 0, 0, 0, 0]));
      host.handle_event(data(0x61, &[0xA1, 0x00, 0x00, 0x2A, 0, 0, 0, 0, 0]));

      let keys: Vec<_> = shared
         .take_events()
         .into_iter()
         .filter_map(|e| match e {
            HidHostEvent::Key { id: key_id, output } => {
               assert_eq!(key_id, id);
               Some(output)
            },
            HidHostEvent::InputReport { .. } => None,
            other => panic!("unexpected {other:?}"),
         })
         .collect();
      assert_eq!(keys, vec![KeyOutput::Char('A'), KeyOutput::Erase]);
   }

   #[test]
   fn test_closing_both_channels_releases_record() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      host.disconnect(id).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Disconnect(0x61), Op::Disconnect(0x60)]);

      host.handle_event(HostEvent::ChannelClosed { cid: 0x61 });
      assert_eq!(host.connections().len(), 1);
      host.handle_event(HostEvent::ChannelClosed { cid: 0x60 });
      assert!(host.connections().is_empty());
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionClosed { id: closed, .. }] if *closed == id
      ));
      assert!(matches!(
         host.disconnect(id),
         Err(HidHostError::UnknownConnection)
      ));
   }

   #[rustfmt::skip]
   const PROTOCOL_DESCRIPTOR_LIST: &[u8] = &[
      0x35, 0x0D,
         0x35, 0x06, 0x19, 0x01, 0x00, 0x09, 0x00, 0x11,
         0x35, 0x03, 0x19, 0x00, 0x11,
   ];

   #[rustfmt::skip]
   const ADDITIONAL_LISTS: &[u8] = &[
      0x35, 0x0F,
         0x35, 0x0D,
            0x35, 0x06, 0x19, 0x01, 0x00, 0x09, 0x00, 0x13,
            0x35, 0x03, 0x19, 0x00, 0x11,
   ];

   #[test]
   fn test_connect_runs_discovery_then_opens_channels() {
      let (mut host, shared) = host();
      host.connect(DEVICE).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Query(DEVICE, SERVICE_CLASS_HID)]);
      assert!(matches!(
         host.connect(DEVICE),
         Err(HidHostError::DiscoveryInProgress)
      ));

      feed_attribute(&mut host, ATTR_PROTOCOL_DESCRIPTOR_LIST, PROTOCOL_DESCRIPTOR_LIST);
      feed_attribute(&mut host, 0x000D, ADDITIONAL_LISTS);
      host.handle_event(HostEvent::SdpQueryComplete {
         status: status::SUCCESS,
      });
      assert_eq!(shared.take_ops(), vec![Op::Create(DEVICE, 0x11, 0x41)]);
      let id = ConnectionId::new(host.connections()[0].id).unwrap();

      host.handle_event(opened(0x41, 0x11, false));
      assert_eq!(shared.take_ops(), vec![Op::Create(DEVICE, 0x13, 0x42)]);
      assert_eq!(state(&mut host, id), HostState::ControlEstablished);

      host.handle_event(opened(0x42, 0x13, false));
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionOpened { id: opened_id, .. }] if *opened_id == id
      ));
   }

   #[test]
   fn test_discovery_without_interrupt_psm_opens_nothing() {
      let (mut host, shared) = host();
      host.connect(DEVICE).unwrap();
      shared.take_ops();

      feed_attribute(&mut host, ATTR_PROTOCOL_DESCRIPTOR_LIST, PROTOCOL_DESCRIPTOR_LIST);
      host.handle_event(HostEvent::SdpQueryComplete {
         status: status::SUCCESS,
      });
      assert!(shared.take_ops().is_empty());
      assert!(host.connections().is_empty());
      match shared.take_events().as_slice() {
         [HidHostEvent::DiscoveryFailed { address, reason }] => {
            assert_eq!(*address, DEVICE);
            assert_eq!(reason, "HID Interrupt PSM missing");
         },
         other => panic!("unexpected events {other:?}"),
      }
   }

   #[test]
   fn test_failed_open_releases_record() {
      let (mut host, shared) = host();
      host.reconnect_control(DEVICE).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Create(DEVICE, PSM_HID_CONTROL, 0x41)]);

      host.handle_event(HostEvent::ChannelOpened {
         cid: 0x41,
         address: DEVICE,
         psm: PSM_HID_CONTROL,
         status: status::CONNECTION_TIMEOUT,
         incoming: false,
      });
      assert!(host.connections().is_empty());
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionFailed {
            status: status::CONNECTION_TIMEOUT,
            ..
         }]
      ));
   }

   #[test]
   fn test_create_failure_is_reported_to_caller() {
      let (mut host, shared) = host();
      *shared.fail_create.lock() = true;
      assert!(matches!(
         host.reconnect_interrupt(DEVICE),
         Err(HidHostError::TransportFailure(status::CONNECTION_REJECTED))
      ));
      assert!(host.connections().is_empty());
   }

   #[test]
   fn test_local_virtual_cable_unplug() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);
      host.send_virtual_cable_unplug(id).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Send(0x60, vec![0x15])]);
      assert!(host.connections()[0].unplugged);

      host.send_exit_suspend(id).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Send(0x60, vec![0x14])]);
   }

   #[test]
   fn test_oversized_set_report_is_rejected() {
      let (mut host, shared) = host();
      let id = incoming(&mut host, &shared);

      let payload = vec![0u8; L2CAP_MTU - 1];
      assert!(matches!(
         host.set_output_report(id, 0x01, &payload),
         Err(HidHostError::InvalidArgument(_))
      ));
      assert_eq!(state(&mut host, id), HostState::ControlEstablished);
      assert!(shared.take_ops().is_empty());

      host.set_output_report(id, 0x01, &payload[..L2CAP_MTU - 2]).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::RequestCanSendNow(0x60)]);
   }

   #[test]
   fn test_interrupt_before_control_waits_for_control() {
      let (mut host, shared) = host();
      host.reconnect_interrupt(DEVICE).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Create(DEVICE, PSM_HID_INTERRUPT, 0x41)]);

      host.handle_event(opened(0x41, PSM_HID_INTERRUPT, false));
      assert!(shared.take_events().is_empty());

      host.reconnect_control(DEVICE).unwrap();
      assert_eq!(shared.take_ops(), vec![Op::Create(DEVICE, PSM_HID_CONTROL, 0x42)]);
      host.handle_event(opened(0x42, PSM_HID_CONTROL, false));
      assert!(shared.take_ops().is_empty());

      let id = ConnectionId::new(host.connections()[0].id).unwrap();
      assert_eq!(state(&mut host, id), HostState::ControlEstablished);
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionOpened { id: opened_id, .. }] if *opened_id == id
      ));
   }

   #[test]
   fn test_interrupt_create_failure_closes_control() {
      let (mut host, shared) = host();
      host.reconnect_control(DEVICE).unwrap();
      shared.take_ops();

      *shared.fail_create.lock() = true;
      host.handle_event(opened(0x41, PSM_HID_CONTROL, false));
      assert_eq!(shared.take_ops(), vec![Op::Disconnect(0x41)]);
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionFailed {
            address,
            status: status::CONNECTION_REJECTED,
         }] if *address == DEVICE
      ));
      assert_eq!(host.connections()[0].state, "IDLE");

      host.handle_event(HostEvent::ChannelClosed { cid: 0x41 });
      assert!(host.connections().is_empty());
   }

   /// Keyboard on report id 1 and a consumer control on report id 2.
   #[rustfmt::skip]
   const REPORT_ID_KEYBOARD: &[u8] = &[
      0x05, 0x01, 0x09, 0x06, 0xA1, 0x01,
      0x85, 0x01,
      0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25, 0x01,
      0x75, 0x01, 0x95, 0x08, 0x81, 0x02,
      0x75, 0x08, 0x95, 0x01, 0x81, 0x01,
      0x19, 0x00, 0x29, 0x65, 0x15, 0x00, 0x25, 0x65,
      0x75, 0x08, 0x95, 0x06, 0x81, 0x00,
      0x85, 0x02,
      0x05, 0x0C, 0x09, 0xE9, 0x75, 0x08, 0x95, 0x01, 0x81, 0x02,
      0xC0,
   ];

   #[test]
   fn test_discovered_descriptor_drives_decoding() {
      let (mut host, shared) = host();
      host.connect(DEVICE).unwrap();
      shared.take_ops();

      let len = REPORT_ID_KEYBOARD.len() as u8;
      let mut list = vec![0x35, len + 6, 0x35, len + 4, 0x08, 0x22, 0x25, len];
      list.extend_from_slice(REPORT_ID_KEYBOARD);
      feed_attribute(&mut host, ATTR_PROTOCOL_DESCRIPTOR_LIST, PROTOCOL_DESCRIPTOR_LIST);
      feed_attribute(&mut host, 0x000D, ADDITIONAL_LISTS);
      feed_attribute(&mut host, ATTR_HID_DESCRIPTOR_LIST, &list);
      host.handle_event(HostEvent::SdpQueryComplete {
         status: status::SUCCESS,
      });
      host.handle_event(opened(0x41, PSM_HID_CONTROL, false));
      host.handle_event(opened(0x42, PSM_HID_INTERRUPT, false));
      assert_eq!(shared.take_ops(), vec![
         Op::Create(DEVICE, PSM_HID_CONTROL, 0x41),
         Op::Create(DEVICE, PSM_HID_INTERRUPT, 0x42)
      ]);
      assert!(matches!(
         shared.take_events().as_slice(),
         [HidHostEvent::ConnectionOpened { .. }]
      ));

      // Consumer control report: not a key
      host.handle_event(data(0x42, &[0xA1, 0x02, 0x04]));
      // Left shift + 'a', held, then 'b'
      host.handle_event(data(0x42, &[0xA1, 0x01, 0x02, 0x00, 0x04, 0, 0, 0, 0, 0]));
      host.handle_event(data(0x42, &[0xA1, 0x01, 0x02, 0x00, 0x04, 0, 0, 0, 0, 0]));
      host.handle_event(data(0x42, &[0xA1, 0x01, 0x00, 0x00, 0x05, 0, 0, 0, 0, 0]));

      let keys: Vec<_> = shared
         .take_events()
         .into_iter()
         .filter_map(|e| match e {
            HidHostEvent::Key { output, .. } => Some(output),
            _ => None,
         })
         .collect();
      assert_eq!(keys, vec![KeyOutput::Char('A'), KeyOutput::Char('b')]);
   }
}
