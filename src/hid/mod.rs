//! HID host protocol core.
//!
//! This module contains the transport independent part of the host: the
//! control channel message codec, report descriptor parsing and keyboard
//! decoding, service discovery, and the per-connection state machine.

pub mod descriptor;
pub mod host;
pub mod keyboard;
pub mod protocol;
pub mod registry;
pub mod sdp;
