//! Stream codec for encoding/decoding wire messages
//!
//! Frames a byte stream (TCP) into serialized frames plus the connection-level
//! control messages (ping, pong, close) that never reach the RPC node.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::{SerializedFrame, MAGIC_BYTES};

/// Maximum message size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + kind(1) + length(4) + sequence(4) = 13 bytes
const HEADER_SIZE: usize = 13;

const KIND_BINARY: u8 = 0x01;
const KIND_TEXT: u8 = 0x02;
const KIND_PING: u8 = 0xF0;
const KIND_PONG: u8 = 0xF1;
const KIND_CLOSE: u8 = 0xFE;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed control message")]
    MalformedControl,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Everything that travels over a byte-stream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Frame(SerializedFrame),
    Ping(u64),
    Pong(u64),
    Close,
}

impl WireMessage {
    fn kind(&self) -> u8 {
        match self {
            WireMessage::Frame(SerializedFrame::Binary(_)) => KIND_BINARY,
            WireMessage::Frame(SerializedFrame::Text(_)) => KIND_TEXT,
            WireMessage::Ping(_) => KIND_PING,
            WireMessage::Pong(_) => KIND_PONG,
            WireMessage::Close => KIND_CLOSE,
        }
    }
}

/// A decoded message with its sequence number
#[derive(Debug, Clone)]
pub struct WireEnvelope {
    /// Sequence number for ordering
    pub sequence: u32,
    pub message: WireMessage,
}

/// Encodes wire messages
pub struct Encoder {
    sequence: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sequence: 0 }
    }

    /// Encode a message into a buffer
    pub fn encode(&mut self, message: &WireMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
        let nonce;
        let body: &[u8] = match message {
            WireMessage::Frame(SerializedFrame::Binary(bytes)) => bytes,
            WireMessage::Frame(SerializedFrame::Text(text)) => text.as_bytes(),
            WireMessage::Ping(n) | WireMessage::Pong(n) => {
                nonce = n.to_be_bytes();
                &nonce
            }
            WireMessage::Close => &[],
        };

        if body.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(body.len(), MAX_MESSAGE_SIZE));
        }

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(message.kind());
        buf.put_u32(body.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(body);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes wire messages
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        kind: u8,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a message from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WireEnvelope>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let kind = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > MAX_MESSAGE_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        kind,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload {
                    kind,
                    length,
                    sequence,
                } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let (kind, sequence) = (*kind, *sequence);
                    let body = buf.split_to(*length).freeze();
                    self.state = DecodeState::Header;

                    let message = Self::message(kind, body)?;
                    return Ok(Some(WireEnvelope { sequence, message }));
                }
            }
        }
    }

    fn message(kind: u8, body: Bytes) -> Result<WireMessage, CodecError> {
        match kind {
            KIND_BINARY => Ok(WireMessage::Frame(SerializedFrame::Binary(body))),
            KIND_TEXT => String::from_utf8(body.to_vec())
                .map(|text| WireMessage::Frame(SerializedFrame::Text(text)))
                .map_err(|_| CodecError::InvalidUtf8),
            KIND_PING | KIND_PONG => {
                let nonce: [u8; 8] = body
                    .as_ref()
                    .try_into()
                    .map_err(|_| CodecError::MalformedControl)?;
                let nonce = u64::from_be_bytes(nonce);
                Ok(if kind == KIND_PING {
                    WireMessage::Ping(nonce)
                } else {
                    WireMessage::Pong(nonce)
                })
            }
            KIND_CLOSE => Ok(WireMessage::Close),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
