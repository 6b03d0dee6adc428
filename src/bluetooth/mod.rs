//! Bluetooth side of the HID host.
//!
//! This module provides the transport boundary used by the protocol core,
//! its BlueZ L2CAP and SDP implementations, and the actor that ties them
//! together.

pub mod l2cap;
pub mod manager;
pub mod sdp_client;
pub mod transport;
