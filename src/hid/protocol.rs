//! HID control channel message definitions.
//!
//! Every message on the control and interrupt channels starts with a header
//! byte: the message type in the high nibble and a type specific parameter
//! (report type, protocol mode, control operation or handshake result) in
//! the low nibble. This module builds the host's outgoing requests and
//! classifies incoming headers.

use std::fmt;

use smallvec::SmallVec;

use crate::bluetooth::transport::Packet;

/// Header byte of an input report on the interrupt channel (`DATA | Input`).
pub const INPUT_REPORT_HEADER: u8 = header(MessageType::Data, ReportType::Input as u8);

/// Message types carried in the high nibble of the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum MessageType {
   Handshake = 0x0,
   HidControl = 0x1,
   GetReport = 0x4,
   SetReport = 0x5,
   GetProtocol = 0x6,
   SetProtocol = 0x7,
   Data = 0xA,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ReportType {
   Input = 0x1,
   Output = 0x2,
   Feature = 0x3,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolMode {
   Boot = 0x0,
   Report = 0x1,
}

/// Parameters of a `HID_CONTROL` message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ControlOperation {
   Nop = 0x0,
   HardReset = 0x1,
   SoftReset = 0x2,
   Suspend = 0x3,
   ExitSuspend = 0x4,
   VirtualCableUnplug = 0x5,
}

/// Result codes of a `HANDSHAKE` message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum HandshakeResult {
   Successful = 0x0,
   NotReady = 0x1,
   InvalidReportId = 0x2,
   UnsupportedRequest = 0x3,
   InvalidParameter = 0x4,
   Unknown = 0xE,
   Fatal = 0xF,
}

const fn header(message_type: MessageType, param: u8) -> u8 {
   ((message_type as u8) << 4) | (param & 0x0f)
}

/// A split control channel header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
   pub raw_type: u8,
   pub param: u8,
}

impl ControlHeader {
   pub fn message_type(&self) -> Option<MessageType> {
      MessageType::from_repr(self.raw_type)
   }

   pub fn control_operation(&self) -> Option<ControlOperation> {
      ControlOperation::from_repr(self.param)
   }

   pub fn handshake_result(&self) -> Option<HandshakeResult> {
      HandshakeResult::from_repr(self.param)
   }
}

impl fmt::Display for ControlHeader {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.message_type() {
         Some(t) => write!(f, "{t}/0x{:x}", self.param),
         None => write!(f, "0x{:x}/0x{:x}", self.raw_type, self.param),
      }
   }
}

/// Splits the first byte of a control message into type and parameter.
pub const fn decode_control_header(byte: u8) -> ControlHeader {
   ControlHeader {
      raw_type: byte >> 4,
      param: byte & 0x0f,
   }
}

pub fn encode_get_report(report_type: ReportType, report_id: u8) -> Packet {
   SmallVec::from_slice(&[
      header(MessageType::GetReport, report_type as u8),
      report_id,
   ])
}

pub fn encode_set_report(report_type: ReportType, report_id: u8, payload: &[u8]) -> Packet {
   [header(MessageType::SetReport, report_type as u8), report_id]
      .into_iter()
      .chain(payload.iter().copied())
      .collect()
}

pub fn encode_get_protocol() -> Packet {
   SmallVec::from_slice(&[header(MessageType::GetProtocol, 0)])
}

pub fn encode_set_protocol(mode: ProtocolMode) -> Packet {
   SmallVec::from_slice(&[header(MessageType::SetProtocol, mode as u8)])
}

pub fn encode_control_operation(op: ControlOperation) -> Packet {
   SmallVec::from_slice(&[header(MessageType::HidControl, op as u8)])
}

/// Kinds of request that wait for a reply on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RequestKind {
   GetReport,
   SetReport,
   GetProtocol,
   SetProtocol,
}

/// Parameters of a request waiting for the control channel to become writable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
   GetReport {
      report_type: ReportType,
      report_id: u8,
   },
   SetReport {
      report_type: ReportType,
      report_id: u8,
      payload: Packet,
   },
   GetProtocol,
   SetProtocol(ProtocolMode),
}

impl PendingRequest {
   pub const fn kind(&self) -> RequestKind {
      match self {
         Self::GetReport { .. } => RequestKind::GetReport,
         Self::SetReport { .. } => RequestKind::SetReport,
         Self::GetProtocol => RequestKind::GetProtocol,
         Self::SetProtocol(_) => RequestKind::SetProtocol,
      }
   }

   /// Builds the wire message for this request.
   pub fn encode(&self) -> Packet {
      match self {
         Self::GetReport {
            report_type,
            report_id,
         } => encode_get_report(*report_type, *report_id),
         Self::SetReport {
            report_type,
            report_id,
            payload,
         } => encode_set_report(*report_type, *report_id, payload),
         Self::GetProtocol => encode_get_protocol(),
         Self::SetProtocol(mode) => encode_set_protocol(*mode),
      }
   }
}
