//! Modbus-TCP (MBAP) framing
//!
//! Wire layout, big-endian throughout:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 2 | Transaction identifier |
//! | 2 | 2 | Protocol identifier (passed through) |
//! | 4 | 2 | Length = payload length + 1 |
//! | 6 | 1 | Unit identifier |
//! | 7 | n | Function code + data |
//!
//! The proxy never looks past the header: function codes and register data are
//! relayed byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// MBAP header size including the unit identifier
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest payload whose length still fits the 16-bit length field
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - 1;

/// One Modbus-TCP frame
///
/// The transaction identifier is only meaningful on the connection the frame
/// was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    /// Function code followed by its data
    pub data: Bytes,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, data: impl Into<Bytes>) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
            data: data.into(),
        }
    }

    /// Same frame under another transaction identifier
    pub fn with_transaction_id(self, transaction_id: u16) -> Self {
        Self {
            transaction_id,
            ..self
        }
    }

    /// Size of the frame on the wire
    pub fn encoded_len(&self) -> usize {
        MBAP_HEADER_LEN + self.data.len()
    }
}

/// Malformed or truncated frame
#[derive(Error, Debug)]
pub enum FramingError {
    /// Stream ended part way through the 7 byte header
    #[error("header too short: received {received} of 7 bytes")]
    HeaderTooShort { received: usize },

    /// Stream ended before the payload announced by the length field
    #[error("incomplete payload: expected {expected} bytes, received {received}")]
    IncompletePayload { expected: usize, received: usize },

    /// Length field of zero leaves no room for the unit identifier
    #[error("invalid length field: {0}")]
    InvalidLength(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write `frame` to `dst` under `transaction_id`
///
/// The protocol identifier and unit identifier are copied from the frame.
pub fn encode_frame(transaction_id: u16, frame: &Frame, dst: &mut BytesMut) {
    debug_assert!(
        frame.data.len() <= MAX_PAYLOAD_LEN,
        "payload of {} bytes does not fit the length field",
        frame.data.len()
    );

    dst.reserve(frame.encoded_len());
    dst.put_u16(transaction_id);
    dst.put_u16(frame.protocol_id);
    dst.put_u16(frame.data.len() as u16 + 1);
    dst.put_u8(frame.unit_id);
    dst.put_slice(&frame.data);
}

/// tokio-util codec for MBAP frames
///
/// `decode_eof` separates an orderly close on a frame boundary (`Ok(None)`)
/// from a stream cut inside a frame (`FramingError`).
#[derive(Debug, Clone, Copy, Default)]
pub struct MbapCodec;

impl MbapCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MbapCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if src.len() < MBAP_HEADER_LEN {
            src.reserve(MBAP_HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[4], src[5]]);
        if length == 0 {
            return Err(FramingError::InvalidLength(length));
        }

        // The length field counts the unit identifier, already part of the header
        let payload_len = length as usize - 1;
        let frame_len = MBAP_HEADER_LEN + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(MBAP_HEADER_LEN);
        let transaction_id = header.get_u16();
        let protocol_id = header.get_u16();
        let _length = header.get_u16();
        let unit_id = header.get_u8();
        let data = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            transaction_id,
            protocol_id,
            unit_id,
            data,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if buf.is_empty() {
            return Ok(None);
        }

        if buf.len() < MBAP_HEADER_LEN {
            return Err(FramingError::HeaderTooShort {
                received: buf.len(),
            });
        }

        let length = u16::from_be_bytes([buf[4], buf[5]]);
        Err(FramingError::IncompletePayload {
            expected: length as usize - 1,
            received: buf.len() - MBAP_HEADER_LEN,
        })
    }
}

impl Encoder<Frame> for MbapCodec {
    type Error = FramingError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FramingError> {
        encode_frame(frame.transaction_id, &frame, dst);
        Ok(())
    }
}
