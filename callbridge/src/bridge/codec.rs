//! Framed codec for host/worker communication.
//!
//! Uses LengthDelimitedCodec for framing + the binary wire format for payloads.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! Framing errors and payload errors are kept apart: a broken frame is an
//! `io::Error` and ends the stream, while a payload that fails to decode
//! inside an intact frame is yielded as `Ok(Some(Err(..)))` so the reader
//! can answer it and keep going.

use std::io;
use std::marker::PhantomData;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::wire::{DecodeError, EncodeError, WireMessage};

/// Default upper bound on a single frame (256 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Codec that frames messages with a 4-byte big-endian length prefix.
pub struct WireCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    /// A header has been consumed but its body has not arrived yet.
    in_frame: bool,
    _phantom: PhantomData<T>,
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WireCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            in_frame: false,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: WireMessage> Decoder for WireCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buffered = src.len();
        match self.inner.decode(src)? {
            Some(frame) => {
                self.in_frame = false;
                Ok(Some(T::decode(frame.freeze())))
            }
            None => {
                // The inner codec strips the header before the body is complete.
                if src.len() < buffered {
                    self.in_frame = true;
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() && !self.in_frame => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            )),
        }
    }
}

impl<T: WireMessage> Encoder<T> for WireCodec<T> {
    type Error = EncodeError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Encode into scratch space first so a rejected value leaves `dst` untouched.
        let mut payload = BytesMut::new();
        item.encode(&mut payload)?;

        let len = payload.len();
        if len > self.max_frame_length {
            return Err(EncodeError::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > 16 * 1024 * 1024 {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_mb = len / (1024 * 1024),
                "Large frame being encoded"
            );
        }
        self.inner.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Request, Response};
    use crate::value::{NdArray, Value};

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::new();

        let req = Request::new("identity", NdArray::vector(vec![1i32, 2, 3]));
        codec.encode(req.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_response() {
        let mut codec = WireCodec::<Response>::new();
        let mut buf = BytesMut::new();

        codec.encode(Response::ok(11i64), &mut buf).unwrap();
        codec.encode(Response::error("nope"), &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            Response::Ok(Value::Int64(11))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap(),
            Response::error("nope")
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_header_is_big_endian_length() {
        let mut codec = WireCodec::<Response>::new();
        let mut buf = BytesMut::new();
        codec.encode(Response::ok(Value::Null), &mut buf).unwrap();
        insta::assert_snapshot!(format!("{:02x?}", &buf[..]), @"[00, 00, 00, 02, 00, 00]");
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = WireCodec::<Request>::new();
        let mut full = BytesMut::new();
        codec
            .encode(Request::new("f", Value::Int64(1)), &mut full)
            .unwrap();

        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[5..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_ok());
    }

    #[test]
    fn malformed_payload_in_intact_frame_is_recoverable() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::new();
        // Frame holding a request whose argument has an unknown tag.
        buf.extend_from_slice(&[0, 0, 0, 6, 1, 0, 0, 0, b'f', 0x42]);
        codec
            .encode(Request::new("g", Value::Null), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.unwrap_err(), DecodeError::UnknownTag(0x42));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.function_name, "g");
    }

    #[test]
    fn eof_after_bare_header_is_unexpected() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 9][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn eof_inside_header_is_unexpected() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn eof_between_frames_is_clean() {
        let mut codec = WireCodec::<Response>::new();
        let mut buf = BytesMut::new();
        codec.encode(Response::ok(1i64), &mut buf).unwrap();

        assert!(codec.decode_eof(&mut buf).unwrap().unwrap().is_ok());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_header_is_a_transport_error() {
        let mut codec = WireCodec::<Request>::with_max_frame_length(16);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_payload_is_rejected_before_writing() {
        let mut codec = WireCodec::<Response>::with_max_frame_length(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Response::ok("a string longer than eight bytes"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, EncodeError::FrameTooLarge { max: 8, .. }));
        assert!(!err.is_io());
        assert!(buf.is_empty());
    }
}
