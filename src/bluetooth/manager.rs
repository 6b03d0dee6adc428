//! HID host manager.
//!
//! The protocol core is synchronous and single-owner. This module runs it
//! inside one tokio actor that serializes user commands from D-Bus with the
//! notifications posted by the L2CAP transport and the SDP client.

use std::{collections::VecDeque, future::Future, pin::Pin, str::FromStr, time::Duration};

use bluer::{
   Adapter, Address, Session,
   agent::{Agent, AgentHandle, ReqError, ReqResult, RequestConfirmation, RequestPinCode},
};
use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time,
};

use crate::{
   bluetooth::{
      l2cap::L2CapTransport,
      sdp_client::SdpClient,
      transport::{Endpoint, HostEvent, Packet},
   },
   config::Config,
   error::{HidHostError, Result},
   event::EventSender,
   hid::{
      host::{ConnectionInfo, HidHost},
      protocol::{ControlOperation, ProtocolMode, ReportType},
      registry::ConnectionId,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 100;
/// Time given to channels to close on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type Reply<T = ()> = oneshot::Sender<Result<T>>;
type AgentFuture<T> = Pin<Box<dyn Future<Output = ReqResult<T>> + Send>>;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   Connect(Address, Reply),
   Reconnect(Address, Endpoint, Reply),
   /// Closes one channel, or both when no endpoint is given.
   Disconnect(ConnectionId, Option<Endpoint>, Reply),
   GetReport(ConnectionId, ReportType, u8, Reply),
   SetReport(ConnectionId, ReportType, u8, Packet, Reply),
   GetProtocol(ConnectionId, Reply),
   SetProtocol(ConnectionId, ProtocolMode, Reply),
   Control(ConnectionId, ControlOperation, Reply),
   ClearUnplugged(Address, Reply<bool>),
   GetConnections(oneshot::Sender<Vec<ConnectionInfo>>),
}

// === Main Manager ===

/// Handle to the HID host actor.
///
/// Cheap to clone; every method is a round trip through the actor inbox.
#[derive(Clone)]
pub struct HostManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl HostManager {
   /// Opens the Bluetooth session, prepares the adapter and starts the actor.
   pub async fn new(events: EventSender, config: Config) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(config, events, command_rx).await?;
      tokio::spawn(actor.run());
      Ok(Self { inbox: command_tx })
   }

   async fn call<T>(&self, cmd: impl FnOnce(Reply<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(cmd(tx))
         .await
         .map_err(|_| HidHostError::ManagerShutdown)?;
      rx.await.map_err(|_| HidHostError::ManagerShutdown)?
   }

   pub async fn connect(&self, address: Address) -> Result<()> {
      self.call(|tx| ManagerCommand::Connect(address, tx)).await
   }

   pub async fn reconnect(&self, address: Address, endpoint: Endpoint) -> Result<()> {
      self
         .call(|tx| ManagerCommand::Reconnect(address, endpoint, tx))
         .await
   }

   pub async fn disconnect(&self, id: ConnectionId, endpoint: Option<Endpoint>) -> Result<()> {
      self
         .call(|tx| ManagerCommand::Disconnect(id, endpoint, tx))
         .await
   }

   pub async fn get_report(
      &self,
      id: ConnectionId,
      report_type: ReportType,
      report_id: u8,
   ) -> Result<()> {
      self
         .call(|tx| ManagerCommand::GetReport(id, report_type, report_id, tx))
         .await
   }

   pub async fn set_report(
      &self,
      id: ConnectionId,
      report_type: ReportType,
      report_id: u8,
      payload: Packet,
   ) -> Result<()> {
      self
         .call(|tx| ManagerCommand::SetReport(id, report_type, report_id, payload, tx))
         .await
   }

   pub async fn get_protocol(&self, id: ConnectionId) -> Result<()> {
      self.call(|tx| ManagerCommand::GetProtocol(id, tx)).await
   }

   pub async fn set_protocol(&self, id: ConnectionId, mode: ProtocolMode) -> Result<()> {
      self
         .call(|tx| ManagerCommand::SetProtocol(id, mode, tx))
         .await
   }

   pub async fn control(&self, id: ConnectionId, op: ControlOperation) -> Result<()> {
      self.call(|tx| ManagerCommand::Control(id, op, tx)).await
   }

   pub async fn clear_unplugged(&self, address: Address) -> Result<bool> {
      self
         .call(|tx| ManagerCommand::ClearUnplugged(address, tx))
         .await
   }

   pub async fn connections(&self) -> Vec<ConnectionInfo> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetConnections(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   command_rx: mpsc::Receiver<ManagerCommand>,
   host_rx: mpsc::UnboundedReceiver<HostEvent>,
   host: HidHost<L2CapTransport, SdpClient>,
   /// Configured devices still waiting for their discovery round, with their names.
   auto_connect: VecDeque<(Address, String)>,

   // Kept alive for the lifetime of the actor
   _session: Session,
   _agent: AgentHandle,
}

impl ManagerActor {
   async fn new(
      config: Config,
      events: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      power_on(&adapter).await?;
      let agent = session.register_agent(pairing_agent(&config)).await?;

      let (host_tx, host_rx) = mpsc::unbounded_channel();
      let mut transport = L2CapTransport::new(host_tx.clone(), config.connect_timeout());
      let discovery = SdpClient::new(host_tx, config.connect_timeout());

      let mut listen = config.listen;
      if listen && let Err(e) = transport.listen().await {
         warn!("Cannot listen for incoming HID channels: {e}");
         listen = false;
      }

      let mut host = HidHost::new(transport, discovery, events, config.max_connections);
      host.set_listen(listen);

      let auto_connect = config
         .devices
         .iter()
         .filter_map(|d| match Address::from_str(&d.address) {
            Ok(address) => Some((address, d.name.clone())),
            Err(e) => {
               warn!("Ignoring configured device {}: {e}", d.address);
               None
            },
         })
         .collect();

      Ok(Self {
         command_rx,
         host_rx,
         host,
         auto_connect,
         _session: session,
         _agent: agent,
      })
   }

   async fn run(mut self) {
      info!("HID host manager starting up");
      self.next_auto_connect();

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("HID host manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(event) = self.host_rx.recv() => {
                 self.host.handle_event(event);
                 self.next_auto_connect();
             }
         }
      }

      self.cleanup().await;
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(addr, reply) => {
            let _ = reply.send(self.host.connect(addr));
         },
         ManagerCommand::Reconnect(addr, endpoint, reply) => {
            let result = match endpoint {
               Endpoint::Control => self.host.reconnect_control(addr),
               Endpoint::Interrupt => self.host.reconnect_interrupt(addr),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(id, endpoint, reply) => {
            let result = match endpoint {
               Some(Endpoint::Control) => self.host.disconnect_control(id),
               Some(Endpoint::Interrupt) => self.host.disconnect_interrupt(id),
               None => self.host.disconnect(id),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::GetReport(id, report_type, report_id, reply) => {
            let result = match report_type {
               ReportType::Input => self.host.get_input_report(id, report_id),
               ReportType::Output => self.host.get_output_report(id, report_id),
               ReportType::Feature => self.host.get_feature_report(id, report_id),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::SetReport(id, report_type, report_id, payload, reply) => {
            let result = match report_type {
               ReportType::Input => self.host.set_input_report(id, report_id, &payload),
               ReportType::Output => self.host.set_output_report(id, report_id, &payload),
               ReportType::Feature => self.host.set_feature_report(id, report_id, &payload),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::GetProtocol(id, reply) => {
            let _ = reply.send(self.host.request_get_protocol(id));
         },
         ManagerCommand::SetProtocol(id, mode, reply) => {
            let _ = reply.send(self.host.request_set_protocol(id, mode));
         },
         ManagerCommand::Control(id, op, reply) => {
            let result = match op {
               ControlOperation::Suspend => self.host.send_suspend(id),
               ControlOperation::ExitSuspend => self.host.send_exit_suspend(id),
               ControlOperation::VirtualCableUnplug => self.host.send_virtual_cable_unplug(id),
               other => Err(HidHostError::InvalidArgument(format!(
                  "{other} is not a supported control operation"
               ))),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::ClearUnplugged(addr, reply) => {
            let _ = reply.send(Ok(self.host.clear_unplugged(addr)));
         },
         ManagerCommand::GetConnections(reply) => {
            let _ = reply.send(self.host.connections());
         },
      }
   }

   /// Starts discovery for the next configured device once the previous
   /// query has finished.
   fn next_auto_connect(&mut self) {
      while !self.host.is_discovering() {
         let Some((addr, name)) = self.auto_connect.pop_front() else {
            return;
         };
         match self.host.connect(addr) {
            Ok(()) => info!("Auto-connecting {name} ({addr})"),
            Err(e) => warn!("Auto-connect to {name} ({addr}) failed: {e}"),
         }
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up HID host manager");
      let ids: Vec<_> = self
         .host
         .connections()
         .iter()
         .filter_map(|c| ConnectionId::new(c.id))
         .collect();
      for id in ids {
         if let Err(e) = self.host.disconnect(id) {
            debug!("Disconnect of {id} failed: {e}");
         }
      }

      // Let the close notifications reach the event bus
      let _ = time::timeout(SHUTDOWN_GRACE, async {
         while let Some(event) = self.host_rx.recv().await {
            self.host.handle_event(event);
            if self.host.connections().is_empty() {
               break;
            }
         }
      })
      .await;
   }
}

async fn power_on(adapter: &Adapter) -> Result<()> {
   let name = adapter.name();
   if !adapter.is_powered().await? {
      adapter.set_powered(true).await?;
      info!("Powered on adapter: {name}");
   }
   info!("Using adapter {name} ({})", adapter.address().await?);
   Ok(())
}

/// Agent answering legacy PIN requests with the configured code and, if
/// enabled, accepting numeric comparison.
fn pairing_agent(config: &Config) -> Agent {
   let pin_code = config.pin_code.clone();
   let auto_accept = config.auto_accept_confirmation;

   Agent {
      request_default: false,
      request_pin_code: Some(Box::new(move |req: RequestPinCode| -> AgentFuture<String> {
         let pin_code = pin_code.clone();
         Box::pin(async move {
            info!("PIN code requested by {} on {}", req.device, req.adapter);
            Ok(pin_code)
         })
      })),
      request_confirmation: Some(Box::new(move |req: RequestConfirmation| -> AgentFuture<()> {
         Box::pin(async move {
            if auto_accept {
               info!(
                  "Confirming passkey {:06} for {} on {}",
                  req.passkey, req.device, req.adapter
               );
               Ok(())
            } else {
               error!("Rejecting passkey confirmation for {}", req.device);
               Err(ReqError::Rejected)
            }
         })
      })),
      ..Default::default()
   }
}
