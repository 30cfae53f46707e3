//! Encoder and decoder for manykv frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Input, Output};
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a guest message into a frame.
    pub fn encode_input(input: &Input) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        input.encode_payload(&mut payload);
        Self::frame(input.tag(), &payload)
    }

    /// Encodes a host message into a frame.
    pub fn encode_output(output: &Output) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        output.encode_payload(&mut payload);
        Self::frame(output.tag(), &payload)
    }

    fn frame(tag: u8, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        Frame::write(&mut buf, tag, payload)?;
        Ok(buf.freeze())
    }
}

/// Decodes a byte stream into messages.
///
/// Bytes may arrive in arbitrary chunks. Frames with an unknown tag or a
/// payload that does not parse are dropped so that one bad message does not
/// poison the stream; only framing errors are reported.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next guest message from the buffer.
    pub fn decode_input(&mut self) -> Result<Option<Input>, ProtocolError> {
        self.decode_with(Input::decode)
    }

    /// Attempts to decode the next host message from the buffer.
    pub fn decode_output(&mut self) -> Result<Option<Output>, ProtocolError> {
        self.decode_with(Output::decode)
    }

    fn decode_with<T>(
        &mut self,
        decode: impl Fn(u8, Bytes) -> Result<T, ProtocolError>,
    ) -> Result<Option<T>, ProtocolError> {
        while let Some(frame) = self.decode_frame()? {
            match decode(frame.tag, frame.payload) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    tracing::debug!(tag = frame.tag, error = %e, "Dropping undecodable frame");
                }
            }
        }
        Ok(None)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::message::{tag, BatchOp, Entry, IteratorOptions};
    use crate::varint::put_varint;
    use proptest::prelude::*;

    fn sample_inputs() -> Vec<Input> {
        vec![
            Input::Put {
                id: 1,
                key: "hello".into(),
                value: "world".into(),
            },
            Input::Batch {
                id: 2,
                ops: vec![BatchOp::put("a", "1"), BatchOp::del("b")],
            },
            Input::Iterator {
                id: 3,
                seq: 0,
                options: IteratorOptions::new().with_limit(5),
                consumed: 0,
                bookmark: None,
                seek: None,
            },
            Input::IteratorAck {
                id: 3,
                seq: 0,
                consumed: 1,
            },
        ]
    }

    #[test]
    fn test_encode_decode_input() {
        let mut decoder = Decoder::new();
        for input in sample_inputs() {
            decoder.extend(&Encoder::encode_input(&input).unwrap());
        }

        for expected in sample_inputs() {
            assert_eq!(decoder.decode_input().unwrap().unwrap(), expected);
        }
        assert!(decoder.decode_input().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_encode_decode_output() {
        let output = Output::IteratorData {
            id: 9,
            seq: 2,
            entries: vec![Entry::new("k", Some("v".into()))],
        };
        let mut decoder = Decoder::new();
        decoder.extend(&Encoder::encode_output(&output).unwrap());
        assert_eq!(decoder.decode_output().unwrap().unwrap(), output);
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let mut decoder = Decoder::new();
        let mut junk = BytesMut::new();
        Frame::write(&mut junk, 250, b"from the future").unwrap();
        decoder.extend(&junk);

        let end = Output::IteratorEnd { id: 1, seq: 0 };
        decoder.extend(&Encoder::encode_output(&end).unwrap());

        assert_eq!(decoder.decode_output().unwrap().unwrap(), end);
    }

    #[test]
    fn test_corrupt_payload_is_skipped() {
        let mut decoder = Decoder::new();

        // A callback whose error code claims more bytes than the payload has
        let mut payload = BytesMut::new();
        put_varint(&mut payload, 1);
        payload.extend_from_slice(&[1, 50]);
        let mut frame = BytesMut::new();
        Frame::write(&mut frame, tag::output::CALLBACK, &payload).unwrap();
        decoder.extend(&frame);

        let ok = Output::Callback {
            id: 2,
            error: Some(ErrorCode::Readonly),
            value: None,
        };
        decoder.extend(&Encoder::encode_output(&ok).unwrap());

        assert_eq!(decoder.decode_output().unwrap().unwrap(), ok);
        assert!(decoder.decode_output().unwrap().is_none());
    }

    #[test]
    fn test_framing_error_is_reported() {
        let mut decoder = Decoder::new();
        decoder.extend(&[0xff; 12]);
        assert!(decoder.decode_input().unwrap_err().is_fatal());
    }

    #[test]
    fn test_clear() {
        let mut decoder = Decoder::new();
        decoder.extend(b"\x05\x00ab");
        assert_eq!(decoder.buffered(), 4);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_same_messages(cuts in proptest::collection::vec(any::<usize>(), 0..8)) {
            let mut stream = Vec::new();
            for input in sample_inputs() {
                stream.extend_from_slice(&Encoder::encode_input(&input).unwrap());
            }

            let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
            points.sort_unstable();

            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(stream.len())) {
                decoder.extend(&stream[start..point]);
                start = point;
                while let Some(input) = decoder.decode_input().unwrap() {
                    decoded.push(input);
                }
            }

            prop_assert_eq!(decoded, sample_inputs());
        }
    }
}
