//! SDP client over an L2CAP socket on PSM 1.
//!
//! Runs one ServiceSearchAttribute transaction per query, following
//! continuation states until the remote has returned every attribute list,
//! then replays each attribute value to the host byte by byte.

use std::time::Duration;

use bluer::{Address, l2cap::SeqPacket};
use log::{debug, info, warn};
use tokio::{task::JoinHandle, time};

use crate::{
   bluetooth::{
      l2cap::{self, EventQueue},
      transport::{Discovery, HostEvent, L2CAP_MTU, PSM_SDP, Packet, status},
   },
   error::{HidHostError, Result},
   hid::sdp::{DataElement, SdpError},
};

const PDU_ERROR_RESPONSE: u8 = 0x01;
const PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST: u8 = 0x06;
const PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE: u8 = 0x07;

/// PDU id, transaction id and parameter length.
const PDU_HEADER_LEN: usize = 5;
const MAX_CONTINUATION_LEN: usize = 16;
/// Attribute bytes requested per response.
const MAX_ATTRIBUTE_BYTES: u16 = 0x0280;
/// Guards against a remote that keeps sending continuation states.
const MAX_TRANSACTIONS: usize = 64;

/// Builds a ServiceSearchAttributeRequest for one 16-bit service class,
/// asking for the full attribute range.
pub fn encode_search_attribute_request(
   tid: u16,
   service_class: u16,
   continuation: &[u8],
) -> Packet {
   let [class_hi, class_lo] = service_class.to_be_bytes();
   let mut params = Packet::new();
   // ServiceSearchPattern: one UUID16
   params.extend_from_slice(&[0x35, 0x03, 0x19, class_hi, class_lo]);
   params.extend_from_slice(&MAX_ATTRIBUTE_BYTES.to_be_bytes());
   // AttributeIDList: 0x0000-0xFFFF
   params.extend_from_slice(&[0x35, 0x05, 0x0A, 0x00, 0x00, 0xFF, 0xFF]);
   params.push(continuation.len() as u8);
   params.extend_from_slice(continuation);

   let mut pdu = Packet::new();
   pdu.push(PDU_SERVICE_SEARCH_ATTRIBUTE_REQUEST);
   pdu.extend_from_slice(&tid.to_be_bytes());
   pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
   pdu.extend_from_slice(&params);
   pdu
}

/// One ServiceSearchAttributeResponse.
#[derive(Debug, PartialEq, Eq)]
pub struct SearchAttributeResponse<'a> {
   /// Attribute list bytes carried by this PDU.
   pub lists: &'a [u8],
   /// Empty on the last response.
   pub continuation: &'a [u8],
}

pub fn parse_search_attribute_response(
   tid: u16,
   pdu: &[u8],
) -> std::result::Result<SearchAttributeResponse<'_>, SdpError> {
   let Some(header) = pdu.get(..PDU_HEADER_LEN) else {
      return Err(SdpError::Truncated {
         expected: PDU_HEADER_LEN,
         actual: pdu.len(),
      });
   };
   let pdu_id = header[0];
   let response_tid = u16::from_be_bytes([header[1], header[2]]);
   let param_len = usize::from(u16::from_be_bytes([header[3], header[4]]));

   let params = &pdu[PDU_HEADER_LEN..];
   if params.len() < param_len {
      return Err(SdpError::Truncated {
         expected: PDU_HEADER_LEN + param_len,
         actual: pdu.len(),
      });
   }
   let params = &params[..param_len];

   if response_tid != tid {
      return Err(SdpError::InvalidPdu {
         reason: "transaction id mismatch",
      });
   }

   match pdu_id {
      PDU_SERVICE_SEARCH_ATTRIBUTE_RESPONSE => {},
      PDU_ERROR_RESPONSE => {
         let code = params
            .get(..2)
            .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]));
         return Err(SdpError::ErrorResponse(code));
      },
      other => return Err(SdpError::UnexpectedPdu(other)),
   }

   let Some(count) = params.get(..2) else {
      return Err(SdpError::InvalidPdu {
         reason: "missing byte count",
      });
   };
   let count = usize::from(u16::from_be_bytes([count[0], count[1]]));
   let rest = &params[2..];
   if rest.len() < count + 1 {
      return Err(SdpError::Truncated {
         expected: PDU_HEADER_LEN + 2 + count + 1,
         actual: PDU_HEADER_LEN + params.len(),
      });
   }
   let (lists, rest) = rest.split_at(count);

   let continuation_len = usize::from(rest[0]);
   if continuation_len > MAX_CONTINUATION_LEN {
      return Err(SdpError::InvalidPdu {
         reason: "continuation state too long",
      });
   }
   let Some(continuation) = rest.get(1..1 + continuation_len) else {
      return Err(SdpError::InvalidPdu {
         reason: "continuation state truncated",
      });
   };

   Ok(SearchAttributeResponse {
      lists,
      continuation,
   })
}

/// Splits the reassembled attribute lists into `(attribute id, value)`
/// pairs. Values keep their data element header.
pub fn attribute_values(lists: &[u8]) -> std::result::Result<Vec<(u16, &[u8])>, SdpError> {
   let (outer, _) = DataElement::parse(lists)?;
   if !outer.is_sequence() {
      return Err(SdpError::InvalidPdu {
         reason: "attribute lists are not a sequence",
      });
   }

   let mut values = Vec::new();
   for record in outer.iter() {
      let mut data = record.payload();
      while !data.is_empty() {
         let (id, rest) = DataElement::parse(data)?;
         let id = id.as_u16().ok_or(SdpError::InvalidPdu {
            reason: "attribute id is not a uint16",
         })?;
         let (_, after) = DataElement::parse(rest)?;
         values.push((id, &rest[..rest.len() - after.len()]));
         data = after;
      }
   }
   Ok(values)
}

/// bluer backed [`Discovery`].
pub struct SdpClient {
   events: EventQueue,
   connect_timeout: Duration,
   next_tid: u16,
   task: Option<JoinHandle<()>>,
}

impl SdpClient {
   pub fn new(events: EventQueue, connect_timeout: Duration) -> Self {
      Self {
         events,
         connect_timeout,
         next_tid: 0,
         task: None,
      }
   }
}

impl Drop for SdpClient {
   fn drop(&mut self) {
      if let Some(task) = self.task.take() {
         task.abort();
      }
   }
}

impl Discovery for SdpClient {
   fn query(&mut self, address: Address, service_class: u16) -> Result<()> {
      if let Some(task) = self.task.take()
         && !task.is_finished()
      {
         warn!("Aborting previous SDP query");
         task.abort();
      }

      let events = self.events.clone();
      let timeout = self.connect_timeout;
      let tid = self.next_tid;
      self.next_tid = self.next_tid.wrapping_add(1);

      self.task = Some(tokio::spawn(async move {
         let status = match run_query(address, service_class, tid, timeout, &events).await {
            Ok(count) => {
               info!("SDP query for {address} returned {count} attributes");
               status::SUCCESS
            },
            Err(e) => {
               warn!("SDP query for {address} failed: {e}");
               match e {
                  HidHostError::Io(e) => status::from_io(&e),
                  HidHostError::TransportFailure(status) => status,
                  _ => status::UNSPECIFIED,
               }
            },
         };
         let _ = events.send(HostEvent::SdpQueryComplete { status });
      }));
      Ok(())
   }
}

async fn run_query(
   address: Address,
   service_class: u16,
   mut tid: u16,
   timeout: Duration,
   events: &EventQueue,
) -> Result<usize> {
   let sp = l2cap::connect(address, PSM_SDP, timeout).await?;

   let mut lists = Vec::new();
   let mut continuation = heapless::Vec::<u8, MAX_CONTINUATION_LEN>::new();
   for _ in 0..MAX_TRANSACTIONS {
      let request = encode_search_attribute_request(tid, service_class, &continuation);
      let mut buf = [0u8; L2CAP_MTU];
      let n = transact(&sp, &request, &mut buf, timeout).await?;
      let response = parse_search_attribute_response(tid, &buf[..n])?;

      lists.extend_from_slice(response.lists);
      if response.continuation.is_empty() {
         return post_attributes(&lists, events);
      }
      continuation.clear();
      // Length is bounded by the parser
      let _ = continuation.extend_from_slice(response.continuation);
      tid = tid.wrapping_add(1);
   }

   Err(SdpError::InvalidPdu {
      reason: "too many continuation responses",
   }
   .into())
}

async fn transact(sp: &SeqPacket, request: &[u8], buf: &mut [u8], timeout: Duration) -> Result<usize> {
   debug!("→ SDP: {}", hex::encode(request));
   sp.send(request).await?;
   let n = time::timeout(timeout, sp.recv(buf))
      .await
      .map_err(|_| HidHostError::TransportFailure(status::CONNECTION_TIMEOUT))??;
   debug!("← SDP: {}", hex::encode(&buf[..n]));
   Ok(n)
}

fn post_attributes(lists: &[u8], events: &EventQueue) -> Result<usize> {
   // A device without the service answers with an empty sequence
   if lists.is_empty() {
      return Ok(0);
   }
   let values = attribute_values(lists)?;
   for &(attribute_id, value) in &values {
      let total_len = u16::try_from(value.len()).unwrap_or(u16::MAX);
      for (offset, &byte) in value.iter().take(usize::from(total_len)).enumerate() {
         let event = HostEvent::SdpAttributeByte {
            attribute_id,
            offset: offset as u16,
            value: byte,
            total_len,
         };
         if events.send(event).is_err() {
            return Err(HidHostError::ManagerShutdown);
         }
      }
   }
   Ok(values.len())
}
