//! L2CAP socket transport for HID channels.
//!
//! Each channel is a BlueZ sequential packet socket with a receive task and
//! a send task, the same split the host uses for every device. Results are
//! reported back as [`HostEvent`]s on one unbounded queue so the host sees
//! them in arrival order.
//!
//! The kernel completes the L2CAP handshake of an incoming channel before
//! the socket is handed to us. Accepting such a channel starts its tasks;
//! declining it closes the socket again.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::mpsc,
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::transport::{
      Cid, HostEvent, L2CAP_MTU, PSM_HID_CONTROL, PSM_HID_INTERRUPT, Packet, Transport, status,
   },
   error::{HidHostError, Result},
};

/// Outgoing packets queued per channel
const SEND_QUEUE_SIZE: usize = 32;
/// First local channel id handed out
const FIRST_CID: Cid = 0x0040;
/// Time a closing channel gets to flush its send queue
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type EventQueue = mpsc::UnboundedSender<HostEvent>;

enum Channel {
   /// Incoming channel waiting for accept or decline.
   Pending { socket: SeqPacket },
   Connecting { task: JoinHandle<()> },
   Open {
      tx: mpsc::Sender<Packet>,
      send_task: JoinHandle<()>,
      recv_task: JoinHandle<()>,
   },
}

struct Channels {
   next_cid: Cid,
   map: HashMap<Cid, Channel>,
}

impl Channels {
   fn free_cid(&mut self) -> Cid {
      loop {
         let cid = self.next_cid;
         self.next_cid = self.next_cid.checked_add(1).unwrap_or(FIRST_CID);
         if !self.map.contains_key(&cid) {
            return cid;
         }
      }
   }
}

type SharedChannels = Arc<Mutex<Channels>>;

/// bluer backed [`Transport`].
pub struct L2CapTransport {
   channels: SharedChannels,
   events: EventQueue,
   connect_timeout: Duration,
   listeners: JoinSet<()>,
}

impl L2CapTransport {
   pub fn new(events: EventQueue, connect_timeout: Duration) -> Self {
      Self {
         channels: Arc::new(Mutex::new(Channels {
            next_cid: FIRST_CID,
            map: HashMap::new(),
         })),
         events,
         connect_timeout,
         listeners: JoinSet::new(),
      }
   }

   /// Listens for device-initiated HID control and interrupt channels.
   ///
   /// Needs the BlueZ input plugin disabled, otherwise bluetoothd owns both PSMs.
   pub async fn listen(&mut self) -> Result<()> {
      for psm in [PSM_HID_CONTROL, PSM_HID_INTERRUPT] {
         let sa = SocketAddr::new(Address::any(), AddressType::BrEdr, psm);
         let listener = SeqPacketListener::bind(sa).await?;
         info!("Listening on PSM 0x{psm:04x}");
         self.listeners.spawn(accept_thread(
            listener,
            psm,
            self.channels.clone(),
            self.events.clone(),
         ));
      }
      Ok(())
   }

   fn post(&self, event: HostEvent) {
      if self.events.send(event).is_err() {
         debug!("Host event queue closed");
      }
   }
}

impl Drop for L2CapTransport {
   fn drop(&mut self) {
      for (_, channel) in self.channels.lock().map.drain() {
         match channel {
            Channel::Connecting { task } => task.abort(),
            Channel::Open { recv_task, .. } => recv_task.abort(),
            Channel::Pending { .. } => {},
         }
      }
   }
}

impl Transport for L2CapTransport {
   fn create_channel(&mut self, address: Address, psm: u16) -> Result<Cid> {
      let channels = self.channels.clone();
      let events = self.events.clone();
      let timeout = self.connect_timeout;

      let mut guard = self.channels.lock();
      let cid = guard.free_cid();
      let task = tokio::spawn(async move {
         let status = match connect(address, psm, timeout).await {
            Ok(sp) => {
               let mut guard = channels.lock();
               // Disconnected while connecting
               if guard.map.remove(&cid).is_none() {
                  return;
               }
               let channel = open(address, cid, sp, &channels, &events);
               guard.map.insert(cid, channel);
               status::SUCCESS
            },
            Err(e) => {
               warn!("Connecting to {address}:0x{psm:04x} failed: {e}");
               if channels.lock().map.remove(&cid).is_none() {
                  return;
               }
               match e {
                  HidHostError::Io(e) => status::from_io(&e),
                  HidHostError::TransportFailure(status) => status,
                  _ => status::UNSPECIFIED,
               }
            },
         };
         let _ = events.send(HostEvent::ChannelOpened {
            cid,
            address,
            psm,
            status,
            incoming: false,
         });
      });
      guard.map.insert(cid, Channel::Connecting { task });

      debug!("Connecting to {address}:0x{psm:04x} as cid 0x{cid:04x}");
      Ok(cid)
   }

   fn accept(&mut self, cid: Cid) {
      let mut guard = self.channels.lock();
      let Some(Channel::Pending { socket }) = guard.map.remove(&cid) else {
         warn!("Accept for unknown cid 0x{cid:04x}");
         return;
      };
      let Ok(peer) = socket.peer_addr() else {
         warn!("Incoming cid 0x{cid:04x} lost its peer");
         drop(guard);
         self.post(HostEvent::ChannelClosed { cid });
         return;
      };
      let channel = open(peer.addr, cid, socket, &self.channels, &self.events);
      guard.map.insert(cid, channel);
      drop(guard);

      self.post(HostEvent::ChannelOpened {
         cid,
         address: peer.addr,
         psm: peer.psm,
         status: status::SUCCESS,
         incoming: true,
      });
   }

   fn decline(&mut self, cid: Cid) {
      if let Some(Channel::Pending { .. }) = self.channels.lock().map.remove(&cid) {
         debug!("Declined cid 0x{cid:04x}");
      }
   }

   fn send(&mut self, cid: Cid, data: &[u8]) -> Result<()> {
      let guard = self.channels.lock();
      let Some(Channel::Open { tx, .. }) = guard.map.get(&cid) else {
         return Err(HidHostError::TransportFailure(status::UNKNOWN_CONNECTION));
      };
      tx.try_send(Packet::from_slice(data)).map_err(|e| match e {
         mpsc::error::TrySendError::Full(_) => {
            HidHostError::TransportFailure(status::MEMORY_CAPACITY_EXCEEDED)
         },
         mpsc::error::TrySendError::Closed(_) => {
            HidHostError::TransportFailure(status::UNKNOWN_CONNECTION)
         },
      })
   }

   fn request_can_send_now(&mut self, cid: Cid) {
      let open = matches!(self.channels.lock().map.get(&cid), Some(Channel::Open { .. }));
      if open {
         self.post(HostEvent::CanSendNow { cid });
      } else {
         warn!("cid 0x{cid:04x} is not open");
      }
   }

   fn disconnect(&mut self, cid: Cid) {
      let removed = self.channels.lock().map.remove(&cid);
      match removed {
         Some(Channel::Connecting { task }) => task.abort(),
         Some(Channel::Open {
            tx,
            send_task,
            recv_task,
         }) => {
            close_open(tx, send_task, recv_task);
         },
         Some(Channel::Pending { .. }) => {},
         None => return,
      }
      debug!("Disconnected cid 0x{cid:04x}");
      self.post(HostEvent::ChannelClosed { cid });
   }
}

pub(crate) async fn connect(address: Address, psm: u16, timeout: Duration) -> Result<SeqPacket> {
   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(timeout, socket.connect(addr))
      .await
      .map_err(|_| HidHostError::TransportFailure(status::CONNECTION_TIMEOUT))??;
   Ok(seq_packet)
}

fn open(
   address: Address,
   cid: Cid,
   sp: SeqPacket,
   channels: &SharedChannels,
   events: &EventQueue,
) -> Channel {
   let (tx, rx) = mpsc::channel(SEND_QUEUE_SIZE);
   let sp = Arc::new(sp);
   let recv_task = tokio::spawn(recv_thread(
      address,
      cid,
      channels.clone(),
      events.clone(),
      sp.clone(),
   ));
   let send_task = tokio::spawn(send_thread(address, rx, sp));
   Channel::Open {
      tx,
      send_task,
      recv_task,
   }
}

/// Stops receiving and lets the send task flush what is already queued.
/// The socket closes once the send task lets go of it.
fn close_open(
   tx: mpsc::Sender<Packet>,
   mut send_task: JoinHandle<()>,
   recv_task: JoinHandle<()>,
) -> JoinHandle<()> {
   recv_task.abort();
   drop(tx);
   tokio::spawn(async move {
      if time::timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
         warn!("Send queue not drained in time, dropping it");
         send_task.abort();
      }
   })
}

async fn accept_thread(
   listener: SeqPacketListener,
   psm: u16,
   channels: SharedChannels,
   events: EventQueue,
) {
   loop {
      let (socket, peer) = match listener.accept().await {
         Ok(accepted) => accepted,
         Err(e) => {
            warn!("Accept on PSM 0x{psm:04x} failed: {e}");
            return;
         },
      };
      let link_handle = AsRef::<Socket<SeqPacket>>::as_ref(&socket).conn_info().map_or(0, |info| info.hci_handle);
      let cid = {
         let mut guard = channels.lock();
         let cid = guard.free_cid();
         guard.map.insert(cid, Channel::Pending { socket });
         cid
      };
      debug!("Incoming {} on PSM 0x{psm:04x} as cid 0x{cid:04x}", peer.addr);

      if events
         .send(HostEvent::IncomingConnection {
            cid,
            address: peer.addr,
            psm,
            link_handle,
         })
         .is_err()
      {
         return;
      }
   }
}

async fn recv_thread(
   adr: Address,
   cid: Cid,
   channels: SharedChannels,
   events: EventQueue,
   sp: Arc<SeqPacket>,
) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      match sp.recv(&mut stack).await {
         Ok(0) => {
            warn!("Connection lost");
            break;
         },
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            let data = Packet::from_slice(recvd);
            if events.send(HostEvent::Data { cid, data }).is_err() {
               return;
            }
            stack[..n].fill(0);
         },
         Err(e) => {
            warn!("Receive from {adr} failed: {e}");
            break;
         },
      }
   }

   // Only report the close if a local disconnect did not get there first.
   // Dropping the entry closes the send queue, which ends the send task.
   let removed = channels.lock().map.remove(&cid);
   if removed.is_some() {
      let _ = events.send(HostEvent::ChannelClosed { cid });
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Packet>, sp: Arc<SeqPacket>) {
   while let Some(data) = rx.recv().await {
      debug!("→ {adr}: {}", hex::encode(&data));
      if let Err(e) = sp.send(&data).await {
         warn!("Failed to send data: {e}");
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;

   #[tokio::test]
   async fn test_close_flushes_queued_packets() {
      let (tx, mut rx) = mpsc::channel::<Packet>(SEND_QUEUE_SIZE);
      let sent = Arc::new(Mutex::new(Vec::new()));

      let sink = sent.clone();
      let send_task = tokio::spawn(async move {
         while let Some(data) = rx.recv().await {
            tokio::task::yield_now().await;
            sink.lock().push(data);
         }
      });
      let recv_task = tokio::spawn(std::future::pending::<()>());

      // Suspend, then virtual cable unplug, queued right before the close
      tx.try_send(Packet::from_slice(&[0x13])).unwrap();
      tx.try_send(Packet::from_slice(&[0x15])).unwrap();
      close_open(tx, send_task, recv_task).await.unwrap();

      let sent = sent.lock();
      assert_eq!(sent.len(), 2);
      assert_eq!(sent[1].as_slice(), &[0x15]);
   }

   #[tokio::test]
   async fn test_close_gives_up_on_stuck_sender() {
      let (tx, _rx) = mpsc::channel::<Packet>(SEND_QUEUE_SIZE);
      let send_task = tokio::spawn(std::future::pending::<()>());
      let recv_task = tokio::spawn(std::future::pending::<()>());

      close_open(tx, send_task, recv_task).await.unwrap();
   }
}
