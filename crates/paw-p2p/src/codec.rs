//! PAW P2P message framing.
//!
//! Every message on an established connection uses the following frame:
//!
//! ```text
//! +--------------+-------------+------------+---------------+
//! | total_length | type_length |    type    |    payload    |
//! |   4 bytes    |   2 bytes   | type_length| remaining     |
//! +--------------+-------------+------------+---------------+
//! ```
//!
//! - All integers are big-endian, no padding.
//! - `total_length = 2 + len(type) + len(payload)`; the 4-byte prefix itself
//!   is not counted.
//! - `total_length` above the configured maximum is rejected from the header
//!   alone, before any space is reserved for the body.

use crate::{NetworkError, NetworkResult, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the type-length field.
const TYPE_LENGTH_SIZE: usize = 2;

/// Keep-alive request.
pub const MSG_PING: &str = "ping";
/// Keep-alive reply.
pub const MSG_PONG: &str = "pong";
/// Peer-exchange request.
pub const MSG_PEX_REQUEST: &str = "pex_request";
/// Peer-exchange reply carrying a peer list.
pub const MSG_PEX_RESPONSE: &str = "pex_response";

/// A decoded application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type tag.
    pub msg_type: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a new message.
    pub fn new(msg_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: payload.into(),
        }
    }

    /// Create a message with an empty payload.
    pub fn empty(msg_type: impl Into<String>) -> Self {
        Self::new(msg_type, Bytes::new())
    }

    /// Whether this message is consumed by the network layer itself.
    pub fn is_internal(&self) -> bool {
        matches!(
            self.msg_type.as_str(),
            MSG_PING | MSG_PONG | MSG_PEX_REQUEST | MSG_PEX_RESPONSE
        )
    }

    /// Size of this message on the wire, including the length prefix.
    pub fn wire_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + TYPE_LENGTH_SIZE + self.msg_type.len() + self.payload.len()
    }
}

/// Value of the `total_length` field for a type and payload.
fn body_length(msg_type: &str, payload: &[u8]) -> usize {
    TYPE_LENGTH_SIZE + msg_type.len() + payload.len()
}

/// Encode a message into a standalone frame.
///
/// The returned buffer is allocated once at its exact final size.
pub fn encode(msg_type: &str, payload: &[u8], max_size: usize) -> NetworkResult<Bytes> {
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_length(msg_type, payload));
    encode_into(msg_type, payload, max_size, &mut dst)?;
    Ok(dst.freeze())
}

fn encode_into(
    msg_type: &str,
    payload: &[u8],
    max_size: usize,
    dst: &mut BytesMut,
) -> NetworkResult<()> {
    let type_len = u16::try_from(msg_type.len()).map_err(|_| {
        NetworkError::InvalidFormat(format!("type tag too long: {} bytes", msg_type.len()))
    })?;

    let total = body_length(msg_type, payload);
    if total > max_size {
        return Err(NetworkError::MessageTooLarge {
            size: total,
            max: max_size,
        });
    }
    let total = u32::try_from(total).map_err(|_| NetworkError::MessageTooLarge {
        size: total,
        max: max_size,
    })?;

    dst.reserve(LENGTH_PREFIX_SIZE + total as usize);
    dst.put_u32(total);
    dst.put_u16(type_len);
    dst.put_slice(msg_type.as_bytes());
    dst.put_slice(payload);
    Ok(())
}

/// Read the `total_length` field and check it against `max_size`.
fn frame_length(header: [u8; LENGTH_PREFIX_SIZE], max_size: usize) -> NetworkResult<usize> {
    let total = u32::from_be_bytes(header) as usize;
    if total > max_size {
        return Err(NetworkError::MessageTooLarge {
            size: total,
            max: max_size,
        });
    }
    if total < TYPE_LENGTH_SIZE {
        return Err(NetworkError::InvalidFormat(format!(
            "frame body of {} bytes cannot hold a type length",
            total
        )));
    }
    Ok(total)
}

/// Split a frame body (everything after the length prefix) into type and payload.
fn decode_body(mut body: Bytes) -> NetworkResult<Message> {
    let type_len = body.get_u16() as usize;
    if type_len > body.remaining() {
        return Err(NetworkError::InvalidFormat(format!(
            "type length {} exceeds remaining {} bytes",
            type_len,
            body.remaining()
        )));
    }
    let type_bytes = body.split_to(type_len);
    let msg_type = std::str::from_utf8(&type_bytes)
        .map_err(|_| NetworkError::InvalidFormat("type tag is not UTF-8".into()))?
        .to_string();

    Ok(Message {
        msg_type,
        payload: body,
    })
}

/// Decode one complete frame.
///
/// Pure: no I/O and no state. `frame` must hold exactly one frame.
pub fn decode(frame: &[u8], max_size: usize) -> NetworkResult<Message> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(NetworkError::InvalidFormat(format!(
            "frame of {} bytes is shorter than the length prefix",
            frame.len()
        )));
    }
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    header.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
    let total = frame_length(header, max_size)?;

    let body = &frame[LENGTH_PREFIX_SIZE..];
    if body.len() != total {
        return Err(NetworkError::InvalidFormat(format!(
            "length prefix says {} bytes, frame has {}",
            total,
            body.len()
        )));
    }

    decode_body(Bytes::copy_from_slice(body))
}

/// Streaming codec for framed connections.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    /// Maximum allowed `total_length`.
    max_size: usize,
}

impl MessageCodec {
    /// Create a codec with the default 10 MiB limit.
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    /// Create a codec with a custom frame limit.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Configured frame limit.
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let header = [src[0], src[1], src[2], src[3]];
        let total = frame_length(header, self.max_size)?;

        let frame_size = LENGTH_PREFIX_SIZE + total;
        if src.len() < frame_size {
            // Length already validated, safe to reserve.
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(total).freeze();
        decode_body(body).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item.msg_type, &item.payload, self.max_size, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode("tx", b"abc", MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(
            frame.as_ref(),
            &[0, 0, 0, 7, 0, 2, b't', b'x', b'a', b'b', b'c']
        );
        assert_eq!(frame.len(), Message::new("tx", &b"abc"[..]).wire_size());
    }

    #[test]
    fn test_roundtrip() {
        let frame = encode("block", b"\x00\x01\x02", MAX_MESSAGE_SIZE).unwrap();
        let msg = decode(&frame, MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(msg.msg_type, "block");
        assert_eq!(msg.payload.as_ref(), b"\x00\x01\x02");
    }

    #[test]
    fn test_empty_type_and_payload() {
        let frame = encode("", b"", MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(frame.as_ref(), &[0, 0, 0, 2, 0, 0]);
        let msg = decode(&frame, MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(msg, Message::empty(""));
    }

    #[test]
    fn test_decode_rejects_oversized_header() {
        // Header claims 4 GiB, body absent.
        let frame = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        match decode(&frame, MAX_MESSAGE_SIZE) {
            Err(NetworkError::MessageTooLarge { size, max }) => {
                assert_eq!(size, u32::MAX as usize);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_type_length() {
        // total_length 4, type_length 9 but only 2 bytes remain.
        let frame = [0, 0, 0, 4, 0, 9, b'a', b'b'];
        assert!(matches!(
            decode(&frame, MAX_MESSAGE_SIZE),
            Err(NetworkError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut frame = encode("tx", b"abc", MAX_MESSAGE_SIZE).unwrap().to_vec();
        frame.push(0);
        assert!(matches!(
            decode(&frame, MAX_MESSAGE_SIZE),
            Err(NetworkError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = vec![0u8; 64];
        assert!(matches!(
            encode("x", &payload, 32),
            Err(NetworkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = MessageCodec::new();
        let frame = encode("ping", b"", MAX_MESSAGE_SIZE).unwrap();

        let mut buf = BytesMut::from(&frame[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[3..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[7..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.msg_type, MSG_PING);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_before_reserving() {
        let mut codec = MessageCodec::with_max_size(1024);
        let mut buf = BytesMut::from(&[0x00, 0x10, 0x00, 0x00][..]);
        let capacity_before = buf.capacity();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::MessageTooLarge { .. })
        ));
        assert_eq!(buf.capacity(), capacity_before);
    }

    #[test]
    fn test_codec_encoder() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("tx", Bytes::from_static(b"1")), &mut buf)
            .unwrap();
        codec
            .encode(Message::new("tx", Bytes::from_static(b"2")), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"1");
        assert_eq!(second.payload.as_ref(), b"2");
    }

    #[test]
    fn test_internal_types() {
        assert!(Message::empty(MSG_PING).is_internal());
        assert!(Message::empty(MSG_PEX_RESPONSE).is_internal());
        assert!(!Message::empty("block").is_internal());
    }
}
