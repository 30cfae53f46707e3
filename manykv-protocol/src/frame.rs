//! Self-delimiting binary frames.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+--------+-------------------+
//! | varint(len)    | tag    | payload           |
//! | 1..=10 bytes   | 1 byte | len - 1 bytes     |
//! +----------------+--------+-------------------+
//! ```
//!
//! The length covers tag and payload, so a receiver finds message boundaries
//! without knowing any schema.

use crate::error::ProtocolError;
use crate::varint::{decode_varint, encoded_len, put_varint, MAX_VARINT_LEN};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest length prefix accepted before the stream is considered corrupt.
pub const MAX_PREFIX_LEN: usize = MAX_VARINT_LEN;

/// A tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message tag, selecting the payload schema.
    pub tag: u8,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(tag: u8, payload: Bytes) -> Self {
        Self { tag, payload }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        Self::write(buf, self.tag, &self.payload)
    }

    /// Appends a frame built from `tag` and `payload` to `buf`.
    pub fn write(buf: &mut BytesMut, tag: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let len = payload.len() as u64 + 1;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        buf.reserve(encoded_len(len) + len as usize);
        put_varint(buf, len);
        buf.put_u8(tag);
        buf.put_slice(payload);
        Ok(())
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)`
    /// if more data is needed, or `Err` if the stream is corrupt. Empty frames
    /// carry no tag and are consumed silently.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        loop {
            let (len, prefix_len) = match decode_varint(&buf[..]) {
                Ok(Some(decoded)) => decoded,
                Ok(None) if buf.len() >= MAX_PREFIX_LEN => {
                    return Err(ProtocolError::PrefixTooLong {
                        max: MAX_PREFIX_LEN,
                    })
                }
                Ok(None) => return Ok(None),
                Err(_) => {
                    return Err(ProtocolError::PrefixTooLong {
                        max: MAX_PREFIX_LEN,
                    })
                }
            };

            if len > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }

            let len = len as usize;
            if buf.len() < prefix_len + len {
                return Ok(None);
            }

            buf.advance(prefix_len);
            if len == 0 {
                continue;
            }

            let mut body = buf.split_to(len).freeze();
            let tag = body.get_u8();
            return Ok(Some(Self { tag, payload: body }));
        }
    }
}
