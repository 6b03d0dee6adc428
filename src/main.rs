//! Bluetooth HID host D-Bus service
//!
//! This service connects to HID keyboards and other HID devices over the
//! L2CAP control and interrupt channels, decodes keyboard input, and exposes
//! report and protocol requests on D-Bus.

use std::{
   io::{self, Write},
   sync::Arc,
   time::Duration,
};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::HostManager;
use dbus::HidHostService;
use event::{EventBus, HidHostEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod hid;

use crate::{dbus::HidHostServiceSignals, error::Result, hid::keyboard::KeyOutput};

const OBJECT_PATH: &str = "/org/hidhost/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting HID host D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.devices.len()
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create the host manager with event sender and config
   let manager = HostManager::new(event_bus.clone(), config).await?;

   // Create D-Bus service
   let service = HidHostService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.hidhost")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("HID host D-Bus service started at org.hidhost");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down HID host service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<HidHostEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<HidHostEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<HidHostService>, event: HidHostEvent) -> Result<()> {
      match event {
         HidHostEvent::ConnectionOpened { id, address } => {
            iface
               .connection_opened(id.get(), &address.to_string())
               .await?;
         },
         HidHostEvent::ConnectionClosed { id, address } => {
            iface
               .connection_closed(id.get(), &address.to_string())
               .await?;
         },
         HidHostEvent::ConnectionFailed { address, status } => {
            iface
               .connection_failed(&address.to_string(), status)
               .await?;
         },
         HidHostEvent::DiscoveryFailed { address, reason } => {
            iface
               .discovery_failed(&address.to_string(), &reason)
               .await?;
         },
         HidHostEvent::InputReport { id, data } => {
            iface.input_report(id.get(), &hex::encode(&data)).await?;
         },
         HidHostEvent::Key { id, output } => {
            echo_key(output);
            let text = match output {
               KeyOutput::Char(c) => c.to_string(),
               KeyOutput::Erase => "\u{8}".to_string(),
            };
            iface.key(id.get(), &text).await?;
         },
         HidHostEvent::ControlResponse {
            id,
            request,
            message_type,
            param,
            payload,
         } => {
            iface
               .control_response(
                  id.get(),
                  &request.to_string(),
                  &message_type.to_string(),
                  param,
                  &hex::encode(&payload),
               )
               .await?;
         },
         HidHostEvent::VirtualCableUnplug { id } => {
            iface.virtual_cable_unplug_received(id.get()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HidHostService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: HidHostEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

/// Echoes decoded keyboard input on the terminal.
fn echo_key(output: KeyOutput) {
   let mut stdout = io::stdout().lock();
   let _ = match output {
      KeyOutput::Char(c) => write!(stdout, "{c}"),
      KeyOutput::Erase => stdout.write_all(b"\x08 \x08"),
   };
   let _ = stdout.flush();
}
