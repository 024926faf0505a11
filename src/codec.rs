//! Length-prefixed protobuf framing for `CastMessage`.
//!
//! Each frame on the wire is a big-endian `u32` byte count followed by that
//! many bytes of an encoded `extensions.api.cast_channel.CastMessage`.

use bytes::{Buf, BufMut, BytesMut};
use crate::{
    cast::cast_channel::{self, cast_message::{PayloadType, ProtocolVersion}},
    error::Error,
    message::{CastMessage, CastMessagePayload},
};
use protobuf::Message;
use tokio_util::codec;

const SIZE_OF_U32: usize = 4;

/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct CastMessageCodec {
    max_frame_len: usize,
}

impl CastMessageCodec {
    pub fn new(max_frame_len: usize) -> CastMessageCodec {
        CastMessageCodec { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for CastMessageCodec {
    fn default() -> CastMessageCodec {
        CastMessageCodec::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl codec::Encoder<CastMessage> for CastMessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: CastMessage,
        dst: &mut BytesMut
    ) -> Result<(), Error>
    {
        let mut proto_msg = cast_channel::CastMessage::new();

        proto_msg.set_protocol_version(ProtocolVersion::CASTV2_1_0);

        proto_msg.set_namespace(msg.namespace);
        proto_msg.set_source_id(msg.source);
        proto_msg.set_destination_id(msg.destination);

        match msg.payload {
            CastMessagePayload::String(s) => {
                proto_msg.set_payload_type(PayloadType::STRING);
                proto_msg.set_payload_utf8(s);
            },

            CastMessagePayload::Binary(b) => {
                proto_msg.set_payload_type(PayloadType::BINARY);
                proto_msg.set_payload_binary(b);
            },
        };

        let proto_bytes = proto_msg.write_to_bytes()?;

        if proto_bytes.len() > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "outgoing frame of {len} bytes exceeds limit of {max} bytes",
                len = proto_bytes.len(),
                max = self.max_frame_len)));
        }

        let proto_len_u32 = u32::try_from(proto_bytes.len())
            .map_err(|_| Error::Protocol("outgoing frame length overflows u32".to_string()))?;

        dst.reserve(SIZE_OF_U32 + proto_bytes.len());

        // Big endian.
        dst.put_u32(proto_len_u32);
        dst.put_slice(&proto_bytes);

        Ok(())
    }
}

impl codec::Decoder for CastMessageCodec {
    type Item = CastMessage;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut
    ) -> Result<Option<CastMessage>, Error>
    {
        if src.len() < SIZE_OF_U32 {
            return Ok(None);
        }

        let mut proto_len_bytes = [0_u8; SIZE_OF_U32];
        proto_len_bytes.copy_from_slice(&src[..SIZE_OF_U32]);
        let proto_len = u32::from_be_bytes(proto_len_bytes) as usize;

        // Checked before buffering the body so a hostile length can't make us allocate.
        if proto_len > self.max_frame_len {
            return Err(Error::Protocol(format!(
                "incoming frame of {proto_len} bytes exceeds limit of {max} bytes",
                max = self.max_frame_len)));
        }

        let total_len = SIZE_OF_U32 + proto_len;

        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut proto_msg =
            cast_channel::CastMessage::parse_from_bytes(&src[SIZE_OF_U32..total_len])?;

        src.advance(total_len);

        let payload = match proto_msg.payload_type() {
            PayloadType::STRING =>
                CastMessagePayload::String(proto_msg.take_payload_utf8()),
            PayloadType::BINARY =>
                CastMessagePayload::Binary(proto_msg.take_payload_binary()),
        };

        Ok(Some(CastMessage {
            namespace: proto_msg.take_namespace(),
            source: proto_msg.take_source_id(),
            destination: proto_msg.take_destination_id(),
            payload,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn sample_message() -> CastMessage {
        CastMessage {
            namespace: "urn:x-cast:com.google.cast.tp.heartbeat".to_string(),
            source: "sender-0".to_string(),
            destination: "receiver-0".to_string(),
            payload: r#"{"type":"PING"}"#.to_string().into(),
        }
    }

    #[test]
    fn encode_writes_length_prefix() {
        let mut codec = CastMessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(sample_message(), &mut buf).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len + SIZE_OF_U32, buf.len());
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let mut codec = CastMessageCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(sample_message(), &mut encoded).unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 3, "partial frame must not be consumed");

        partial.extend_from_slice(&encoded[encoded.len() - 3..]);
        let msg = codec.decode(&mut partial).unwrap().expect("whole frame");
        assert_eq!(msg, sample_message());
        assert!(partial.is_empty());
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = CastMessageCodec::default();
        let mut buf = BytesMut::new();

        let mut second = sample_message();
        second.payload = CastMessagePayload::Binary(vec![1, 2, 3]);

        codec.encode(sample_message(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(sample_message()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_length_rejected_from_prefix() {
        let mut codec = CastMessageCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(1025);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    }

    #[test]
    fn oversized_outgoing_message_rejected() {
        let mut codec = CastMessageCodec::new(16);
        let mut buf = BytesMut::new();

        let err = codec.encode(sample_message(), &mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_body_is_protocol_error() {
        let mut codec = CastMessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0xff, 0xff, 0xff]);

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }
}
