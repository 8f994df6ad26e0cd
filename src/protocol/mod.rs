//! Protocol module - Defines the wire protocol for Tandem communication
//!
//! Layers, outermost first:
//! - the stream codec (magic, kind, length, sequence header) for byte-stream
//!   connections
//! - the JSON hello exchanged once per connection
//! - frames, encoded in the negotiated serialization format

mod codec;
pub mod handshake;
mod message;
mod serializer;

pub use codec::*;
pub use handshake::{ExtensionOffer, Hello};
pub use message::*;
pub use serializer::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for Tandem communication
pub const DEFAULT_PORT: u16 = 24810;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x54, 0x4E, 0x44, 0x4D]; // "TNDM"
