//! Protocol layer - value model, packet codec and command records
//!
//! This module provides:
//! - Self-describing values with raw byte buffers
//! - Length-prefixed packet framing
//! - Command names and diagnostic records

pub mod codec;
pub mod messages;
pub mod value;

pub use codec::{FrameCodec, Packet, decode_packet, decode_payload, encode_packet};
pub use messages::{Commands, Location, Message, MessageKind, Note};
pub use value::{Map, Value};
