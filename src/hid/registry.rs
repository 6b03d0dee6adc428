//! Connection registry.
//!
//! Keeps one [`HidHostConnection`] per device address and hands out
//! connection ids. The number of live records is bounded by the configured
//! capacity; with the default capacity of one the registry behaves as a
//! single device slot.

use std::{collections::HashSet, fmt, num::NonZeroU16};

use bluer::Address;
use log::{debug, info};

use crate::{
   bluetooth::transport::Cid,
   error::{HidHostError, Result},
   hid::host::HidHostConnection,
};

/// Handle of a connection record. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(NonZeroU16);

impl ConnectionId {
   pub const fn new(id: u16) -> Option<Self> {
      match NonZeroU16::new(id) {
         Some(id) => Some(Self(id)),
         None => None,
      }
   }

   pub const fn get(self) -> u16 {
      self.0.get()
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", self.0)
   }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
   connections: Vec<HidHostConnection>,
   capacity: usize,
   last_id: u16,
   /// Devices that sent a virtual cable unplug and whose record was released.
   unplugged: HashSet<Address>,
}

impl ConnectionRegistry {
   pub fn new(capacity: usize) -> Self {
      let capacity = capacity.clamp(1, usize::from(u16::MAX) - 1);
      Self {
         connections: Vec::with_capacity(capacity),
         capacity,
         last_id: 0,
         unplugged: HashSet::new(),
      }
   }

   /// Returns the record for `address`, creating one if a slot is free.
   pub fn get_or_create(&mut self, address: Address) -> Result<&mut HidHostConnection> {
      if let Some(index) = self.connections.iter().position(|c| c.address == address) {
         return Ok(&mut self.connections[index]);
      }

      if self.connections.len() >= self.capacity {
         return Err(HidHostError::RegistryFull(address));
      }

      let id = self.next_id();
      let mut conn = HidHostConnection::new(id, address);
      conn.unplugged = self.unplugged.contains(&address);
      debug!("New connection record {id} for {address}");

      self.connections.push(conn);
      let last = self.connections.len() - 1;
      Ok(&mut self.connections[last])
   }

   pub fn find_by_address(&mut self, address: Address) -> Option<&mut HidHostConnection> {
      self.connections.iter_mut().find(|c| c.address == address)
   }

   pub fn find_by_connection_id(&mut self, id: ConnectionId) -> Option<&mut HidHostConnection> {
      self.connections.iter_mut().find(|c| c.connection_id == id)
   }

   /// Finds the record owning `cid` as its control or interrupt channel.
   pub fn find_by_channel_id(&mut self, cid: Cid) -> Option<&mut HidHostConnection> {
      self.connections.iter_mut().find(|c| c.owns_channel(cid))
   }

   /// Retires a record. Its id is not handed out again while another record
   /// holds it, and an unplugged device stays unplugged.
   pub fn release(&mut self, id: ConnectionId) -> Option<HidHostConnection> {
      let index = self.connections.iter().position(|c| c.connection_id == id)?;
      let conn = self.connections.swap_remove(index);
      if conn.unplugged {
         self.unplugged.insert(conn.address);
      }
      debug!("Released connection record {id} for {}", conn.address);
      Some(conn)
   }

   pub fn is_unplugged(&self, address: Address) -> bool {
      self.unplugged.contains(&address)
         || self
            .connections
            .iter()
            .any(|c| c.address == address && c.unplugged)
   }

   /// Allows a virtually unplugged device to connect again.
   pub fn clear_unplugged(&mut self, address: Address) -> bool {
      let mut cleared = self.unplugged.remove(&address);
      if let Some(conn) = self.find_by_address(address) {
         cleared |= conn.unplugged;
         conn.unplugged = false;
      }
      if cleared {
         info!("Cleared virtual cable unplug for {address}");
      }
      cleared
   }

   pub fn iter(&self) -> impl Iterator<Item = &HidHostConnection> {
      self.connections.iter()
   }

   fn next_id(&mut self) -> ConnectionId {
      loop {
         self.last_id = self.last_id.wrapping_add(1);
         let Some(id) = ConnectionId::new(self.last_id) else {
            continue;
         };
         if !self.connections.iter().any(|c| c.connection_id == id) {
            return id;
         }
      }
   }
}
