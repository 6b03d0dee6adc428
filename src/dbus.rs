use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{manager::HostManager, transport::Endpoint},
   hid::{
      protocol::{ControlOperation, ProtocolMode, ReportType},
      registry::ConnectionId,
   },
};

pub struct HidHostService {
   manager: HostManager,
}

impl HidHostService {
   pub const fn new(manager: HostManager) -> Self {
      Self { manager }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_id(id: u16) -> zbus::fdo::Result<ConnectionId> {
   ConnectionId::new(id)
      .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Connection id must be non-zero".into()))
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.hidhost.Host1")]
impl HidHostService {
   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.connect(addr).await.map_err(failed)?;
      info!("Connecting to {address}");
      Ok(true)
   }

   async fn reconnect_control(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .manager
         .reconnect(addr, Endpoint::Control)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn reconnect_interrupt(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .manager
         .reconnect(addr, Endpoint::Interrupt)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect(parse_id(id)?, None)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_control(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect(parse_id(id)?, Some(Endpoint::Control))
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_interrupt(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect(parse_id(id)?, Some(Endpoint::Interrupt))
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn get_report(
      &self,
      id: u16,
      report_type: String,
      report_id: u8,
   ) -> zbus::fdo::Result<bool> {
      let report_type = ReportType::from_str(&report_type).map_err(|_| {
         zbus::fdo::Error::InvalidArgs(format!("Invalid report type: {report_type}"))
      })?;
      self
         .manager
         .get_report(parse_id(id)?, report_type, report_id)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn set_report(
      &self,
      id: u16,
      report_type: String,
      report_id: u8,
      payload: String,
   ) -> zbus::fdo::Result<bool> {
      let report_type = ReportType::from_str(&report_type).map_err(|_| {
         zbus::fdo::Error::InvalidArgs(format!("Invalid report type: {report_type}"))
      })?;
      let payload = hex::decode(payload).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self
         .manager
         .set_report(parse_id(id)?, report_type, report_id, payload.into())
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn get_protocol(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .get_protocol(parse_id(id)?)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn set_protocol(&self, id: u16, mode: String) -> zbus::fdo::Result<bool> {
      let mode = ProtocolMode::from_str(&mode)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid protocol mode: {mode}")))?;
      self
         .manager
         .set_protocol(parse_id(id)?, mode)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn suspend(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .control(parse_id(id)?, ControlOperation::Suspend)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn exit_suspend(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .control(parse_id(id)?, ControlOperation::ExitSuspend)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn virtual_cable_unplug(&self, id: u16) -> zbus::fdo::Result<bool> {
      self
         .manager
         .control(parse_id(id)?, ControlOperation::VirtualCableUnplug)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   /// Returns whether the device was unplugged.
   async fn clear_unplugged(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.manager.clear_unplugged(addr).await.map_err(failed)
   }

   async fn get_connections(&self) -> zbus::fdo::Result<String> {
      let connections = self.manager.connections().await;
      serde_json::to_string(&connections).map_err(failed)
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_opened(
      emitter: &SignalEmitter<'_>,
      id: u16,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_closed(
      emitter: &SignalEmitter<'_>,
      id: u16,
      address: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_failed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      status: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_failed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      reason: &str,
   ) -> zbus::Result<()>;

   /// Raw interrupt channel payload as hex.
   #[zbus(signal)]
   pub async fn input_report(emitter: &SignalEmitter<'_>, id: u16, data: &str)
   -> zbus::Result<()>;

   /// Decoded keyboard output; a backspace character for erase.
   #[zbus(signal)]
   pub async fn key(emitter: &SignalEmitter<'_>, id: u16, text: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn control_response(
      emitter: &SignalEmitter<'_>,
      id: u16,
      request: &str,
      message_type: &str,
      param: u8,
      payload: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn virtual_cable_unplug_received(
      emitter: &SignalEmitter<'_>,
      id: u16,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn connections(&self) -> String {
      self.get_connections().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connection_count(&self) -> u32 {
      self.manager.connections().await.len() as u32
   }
}
