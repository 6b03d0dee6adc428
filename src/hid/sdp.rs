//! Service discovery for HID devices.
//!
//! Attribute values returned by an SDP query are nested data elements. This
//! module provides a small reader for them and [`SdpQuery`], which collects
//! the attribute bytes of one query and extracts the control and interrupt
//! PSMs plus the report descriptor of the HID service record.

use std::fmt;

use bluer::Address;
use log::{debug, info};
use thiserror::Error;

use crate::{
   bluetooth::transport::Endpoint,
   error::{HidHostError, Result},
   hid::descriptor::ReportDescriptor,
};

/// Human Interface Device service class.
pub const SERVICE_CLASS_HID: u16 = 0x1124;

pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
pub const ATTR_ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS: u16 = 0x000D;
pub const ATTR_HID_DESCRIPTOR_LIST: u16 = 0x0206;

pub const PROTOCOL_L2CAP: u32 = 0x0100;

/// Largest attribute value kept in the collection buffer.
pub const MAX_ATTRIBUTE_VALUE_SIZE: usize = 300;

const BASE_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB);

/// Error type for SDP decoding.
#[derive(Error, Debug)]
pub enum SdpError {
   #[error("Data element truncated: need {expected} bytes, have {actual}")]
   Truncated { expected: usize, actual: usize },

   #[error("Unknown data element type {0}")]
   UnknownType(u8),

   #[error("Unexpected PDU 0x{0:02x}")]
   UnexpectedPdu(u8),

   #[error("Remote error response 0x{0:04x}")]
   ErrorResponse(u16),

   #[error("Invalid PDU: {reason}")]
   InvalidPdu { reason: &'static str },
}

/// Data element types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ElementType {
   Nil = 0,
   UnsignedInt = 1,
   SignedInt = 2,
   Uuid = 3,
   Text = 4,
   Bool = 5,
   Sequence = 6,
   Alternative = 7,
   Url = 8,
}

/// One data element borrowed from an attribute value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataElement<'a> {
   element_type: ElementType,
   payload: &'a [u8],
}

impl fmt::Debug for DataElement<'_> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}({})", self.element_type, hex::encode(self.payload))
   }
}

impl<'a> DataElement<'a> {
   /// Reads the element at the start of `data` and returns it with the rest.
   pub fn parse(data: &'a [u8]) -> std::result::Result<(Self, &'a [u8]), SdpError> {
      let Some(&descriptor) = data.first() else {
         return Err(SdpError::Truncated {
            expected: 1,
            actual: 0,
         });
      };
      let element_type =
         ElementType::from_repr(descriptor >> 3).ok_or(SdpError::UnknownType(descriptor >> 3))?;
      let size_index = descriptor & 0x07;

      let (header_len, payload_len) = match size_index {
         0 if element_type == ElementType::Nil => (1, 0),
         0..=4 => (1, 1usize << size_index),
         _ => {
            let width = 1usize << (size_index - 5);
            let Some(len_bytes) = data.get(1..1 + width) else {
               return Err(SdpError::Truncated {
                  expected: 1 + width,
                  actual: data.len(),
               });
            };
            let len = len_bytes
               .iter()
               .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            (1 + width, len)
         },
      };

      let end = header_len + payload_len;
      if data.len() < end {
         return Err(SdpError::Truncated {
            expected: end,
            actual: data.len(),
         });
      }

      Ok((
         Self {
            element_type,
            payload: &data[header_len..end],
         },
         &data[end..],
      ))
   }

   pub const fn element_type(&self) -> ElementType {
      self.element_type
   }

   pub const fn payload(&self) -> &'a [u8] {
      self.payload
   }

   pub const fn is_sequence(&self) -> bool {
      matches!(self.element_type, ElementType::Sequence)
   }

   /// Iterates the children of a sequence or alternative.
   ///
   /// Other element types yield nothing.
   pub fn iter(&self) -> Elements<'a> {
      match self.element_type {
         ElementType::Sequence | ElementType::Alternative => Elements { rest: self.payload },
         _ => Elements { rest: &[] },
      }
   }

   /// Unsigned integer of at most 16 bits.
   pub fn as_u16(&self) -> Option<u16> {
      if self.element_type != ElementType::UnsignedInt {
         return None;
      }
      match *self.payload {
         [v] => Some(u16::from(v)),
         [hi, lo] => Some(u16::from_be_bytes([hi, lo])),
         _ => None,
      }
   }

   /// Short form of a UUID. 128-bit UUIDs are only shortened when they are
   /// derived from the Bluetooth base UUID.
   pub fn as_uuid32(&self) -> Option<u32> {
      if self.element_type != ElementType::Uuid {
         return None;
      }
      match *self.payload {
         [hi, lo] => Some(u32::from(u16::from_be_bytes([hi, lo]))),
         [a, b, c, d] => Some(u32::from_be_bytes([a, b, c, d])),
         _ => {
            let uuid = uuid::Uuid::from_slice(self.payload).ok()?;
            let value = uuid.as_u128();
            let short = (value >> 96) as u32;
            let base = BASE_UUID.as_u128() & ((1u128 << 96) - 1);
            (value & ((1u128 << 96) - 1) == base).then_some(short)
         },
      }
   }
}

/// Iterator over consecutive data elements. Stops at the first malformed one.
#[derive(Debug, Clone)]
pub struct Elements<'a> {
   rest: &'a [u8],
}

impl<'a> Elements<'a> {
   pub const fn new(data: &'a [u8]) -> Self {
      Self { rest: data }
   }
}

impl<'a> Iterator for Elements<'a> {
   type Item = DataElement<'a>;

   fn next(&mut self) -> Option<Self::Item> {
      if self.rest.is_empty() {
         return None;
      }
      match DataElement::parse(self.rest) {
         Ok((element, rest)) => {
            self.rest = rest;
            Some(element)
         },
         Err(e) => {
            debug!("Stopping data element walk: {e}");
            self.rest = &[];
            None
         },
      }
   }
}

/// Returns the PSM of an L2CAP entry in a protocol descriptor list.
///
/// A protocol descriptor is a sequence whose first element is the protocol
/// UUID, followed by its parameters.
fn l2cap_psm(protocol: DataElement<'_>) -> Option<u16> {
   let mut params = protocol.iter();
   let uuid = params.next()?.as_uuid32()?;
   if uuid != PROTOCOL_L2CAP {
      return None;
   }
   params.next()?.as_u16()
}

/// First L2CAP PSM in a protocol descriptor list attribute value.
pub fn parse_protocol_descriptor_list(value: &[u8]) -> Option<u16> {
   Elements::new(value)
      .flat_map(|list| list.iter())
      .filter(DataElement::is_sequence)
      .find_map(l2cap_psm)
}

/// First L2CAP PSM in an additional protocol descriptor lists attribute value.
pub fn parse_additional_protocol_descriptor_lists(value: &[u8]) -> Option<u16> {
   Elements::new(value)
      .flat_map(|lists| lists.iter())
      .filter(DataElement::is_sequence)
      .flat_map(|list| list.iter())
      .filter(DataElement::is_sequence)
      .find_map(l2cap_psm)
}

/// Raw report descriptor from a HID descriptor list attribute value.
///
/// Each entry is a sequence of descriptor type and descriptor bytes.
pub fn parse_hid_descriptor_list(value: &[u8]) -> Option<&[u8]> {
   Elements::new(value)
      .flat_map(|list| list.iter())
      .filter(DataElement::is_sequence)
      .flat_map(|entry| entry.iter())
      .find_map(|e| (e.element_type() == ElementType::Text).then_some(e.payload()))
}

/// What a finished query found out about a HID device.
#[derive(Debug, Clone)]
pub struct HidServiceRecord {
   pub control_psm: u16,
   pub interrupt_psm: u16,
   pub descriptor: Option<ReportDescriptor>,
}

/// Attribute collection for one running discovery query.
#[derive(Debug)]
pub struct SdpQuery {
   address: Address,
   buffer: [u8; MAX_ATTRIBUTE_VALUE_SIZE],
   control_psm: Option<u16>,
   interrupt_psm: Option<u16>,
   descriptor: Option<ReportDescriptor>,
}

impl SdpQuery {
   pub const fn new(address: Address) -> Self {
      Self {
         address,
         buffer: [0; MAX_ATTRIBUTE_VALUE_SIZE],
         control_psm: None,
         interrupt_psm: None,
         descriptor: None,
      }
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   /// Stores one attribute value byte. The attribute is interpreted once its
   /// last byte arrives.
   ///
   /// Attributes larger than the buffer are rejected byte by byte.
   pub fn push_byte(
      &mut self,
      attribute_id: u16,
      offset: u16,
      value: u8,
      total_len: u16,
   ) -> Result<()> {
      let total_len = usize::from(total_len);
      if total_len > MAX_ATTRIBUTE_VALUE_SIZE {
         return Err(HidHostError::AttributeBufferExceeded {
            available: MAX_ATTRIBUTE_VALUE_SIZE,
            required: total_len,
         });
      }

      let offset = usize::from(offset);
      if offset >= total_len {
         return Ok(());
      }
      self.buffer[offset] = value;

      if offset + 1 == total_len {
         self.complete_attribute(attribute_id, total_len);
      }
      Ok(())
   }

   fn complete_attribute(&mut self, attribute_id: u16, len: usize) {
      let value = &self.buffer[..len];
      match attribute_id {
         ATTR_PROTOCOL_DESCRIPTOR_LIST => {
            if self.control_psm.is_none()
               && let Some(psm) = parse_protocol_descriptor_list(value)
            {
               info!("{}: HID Control PSM 0x{psm:04x}", self.address);
               self.control_psm = Some(psm);
            }
         },
         ATTR_ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS => {
            if self.interrupt_psm.is_none()
               && let Some(psm) = parse_additional_protocol_descriptor_lists(value)
            {
               info!("{}: HID Interrupt PSM 0x{psm:04x}", self.address);
               self.interrupt_psm = Some(psm);
            }
         },
         ATTR_HID_DESCRIPTOR_LIST => {
            if let Some(bytes) = parse_hid_descriptor_list(value) {
               debug!("{}: HID descriptor {}", self.address, hex::encode(bytes));
               self.descriptor = Some(ReportDescriptor::parse(bytes));
            }
         },
         _ => {},
      }
   }

   /// Ends the query. Both PSMs must have been found.
   pub fn finish(self) -> Result<HidServiceRecord> {
      let control_psm = self
         .control_psm
         .ok_or(HidHostError::DiscoveryIncomplete(Endpoint::Control))?;
      let interrupt_psm = self
         .interrupt_psm
         .ok_or(HidHostError::DiscoveryIncomplete(Endpoint::Interrupt))?;
      Ok(HidServiceRecord {
         control_psm,
         interrupt_psm,
         descriptor: self.descriptor,
      })
   }
}
