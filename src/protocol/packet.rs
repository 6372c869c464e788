//! Packet framing for the client wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────────┬────────────────────────┐
//! │ type(1B) │ len (3B)     │   body                 │
//! │ u8       │ u24 BE       │                        │
//! └──────────┴──────────────┴────────────────────────┘
//! ```
//! Length = size of the body only, NOT including the 4-byte header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::types::{Error, Result};

/// Fixed header size: one type byte plus a 24-bit body length.
pub const HEADER_LEN: usize = 4;

/// Largest body a 24-bit length can describe.
pub const MAX_BODY_LEN: usize = 0x00FF_FFFF;

/// Packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    Data = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::HandshakeAck),
            0x03 => Ok(PacketType::Heartbeat),
            0x04 => Ok(PacketType::Data),
            other => Err(Error::decode(format!("unknown packet type 0x{:02X}", other))),
        }
    }
}

/// One framed unit off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub body: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} packet ({} bytes)", self.kind, self.body.len())
    }
}

/// Frame a body with its header.
pub fn pack(kind: PacketType, body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_BODY_LEN {
        return Err(Error::FrameTooLarge {
            len: body.len(),
            max: MAX_BODY_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(kind as u8);
    // Lower three bytes of the big-endian u32.
    buf.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Try to take one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds less than a header or less than the
/// declared body; nothing is consumed and the caller should read more bytes.
/// On success the packet's bytes are removed and the remainder stays in `buf`.
///
/// A frame with an unknown type tag is consumed and reported as
/// [`Error::Decode`]. A declared body larger than `max_body` is reported as
/// [`Error::FrameTooLarge`] without consuming anything.
pub fn unpack(buf: &mut BytesMut, max_body: usize) -> Result<Option<Packet>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let body_len = body_len(&buf[1..HEADER_LEN]);
    if body_len > max_body {
        return Err(Error::FrameTooLarge {
            len: body_len,
            max: max_body,
        });
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(body_len).freeze();
    let kind = PacketType::try_from(tag)?;
    Ok(Some(Packet { kind, body }))
}

fn body_len(header: &[u8]) -> usize {
    header
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pack_layout() {
        let frame = pack(PacketType::Data, b"abc").unwrap();
        assert_eq!(&frame[..], &[0x04, 0x00, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_unpack_leaves_remainder() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&pack(PacketType::Heartbeat, b"").unwrap());
        buf.extend_from_slice(&pack(PacketType::Data, b"xy").unwrap());

        let first = unpack(&mut buf, MAX_BODY_LEN).unwrap().unwrap();
        assert_eq!(first, Packet::new(PacketType::Heartbeat, Bytes::new()));
        assert_eq!(buf.len(), HEADER_LEN + 2);

        let second = unpack(&mut buf, MAX_BODY_LEN).unwrap().unwrap();
        assert_eq!(second.kind, PacketType::Data);
        assert_eq!(&second.body[..], b"xy");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_header_is_absent() {
        let mut buf = BytesMut::from(&[0x04u8, 0x00][..]);
        assert_eq!(unpack(&mut buf, MAX_BODY_LEN).unwrap(), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_one_byte_short_then_completed() {
        let frame = pack(PacketType::Data, b"hello").unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert_eq!(unpack(&mut buf, MAX_BODY_LEN).unwrap(), None);
        assert_eq!(buf.len(), frame.len() - 1);

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let packet = unpack(&mut buf, MAX_BODY_LEN).unwrap().unwrap();
        assert_eq!(&packet.body[..], b"hello");
    }

    #[test]
    fn test_unknown_type_is_consumed() {
        let mut buf = BytesMut::from(&[0x09u8, 0x00, 0x00, 0x01, 0xAA, 0x03, 0x00, 0x00, 0x00][..]);
        assert!(matches!(unpack(&mut buf, MAX_BODY_LEN), Err(Error::Decode(_))));
        let next = unpack(&mut buf, MAX_BODY_LEN).unwrap().unwrap();
        assert_eq!(next.kind, PacketType::Heartbeat);
    }

    #[test]
    fn test_oversized_body_rejected_without_consuming() {
        let mut buf = BytesMut::from(&[0x04u8, 0x00, 0x01, 0x00][..]);
        let err = unpack(&mut buf, 16).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len: 256, max: 16 }));
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn test_pack_rejects_body_beyond_u24() {
        let body = vec![0u8; MAX_BODY_LEN + 1];
        assert!(pack(PacketType::Data, &body).is_err());
    }

    proptest! {
        #[test]
        fn split_frame_reassembles(body in proptest::collection::vec(any::<u8>(), 0..512), cut in 0usize..600) {
            let frame = pack(PacketType::Data, &body).unwrap();
            let cut = cut % (frame.len() + 1);

            let mut whole = BytesMut::from(&frame[..]);
            let expected = unpack(&mut whole, MAX_BODY_LEN).unwrap().unwrap();

            let mut buf = BytesMut::from(&frame[..cut]);
            let mut got = unpack(&mut buf, MAX_BODY_LEN).unwrap();
            if cut < frame.len() {
                prop_assert!(got.is_none());
                prop_assert_eq!(buf.len(), cut);
                buf.extend_from_slice(&frame[cut..]);
                got = unpack(&mut buf, MAX_BODY_LEN).unwrap();
            }
            prop_assert_eq!(got, Some(expected));
            prop_assert!(buf.is_empty());
        }
    }
}
