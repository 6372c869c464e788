//! Application message envelope carried inside DATA packets.
//!
//! Layout:
//! ```text
//! ┌──────────┬────────────────┬──────────────────────────────┬──────────┐
//! │ flag(1B) │ id (varint)    │ route                        │ body     │
//! │          │ REQUEST and    │ REQUEST, NOTIFY and PUSH:    │          │
//! │          │ RESPONSE only  │ compressed: u16 BE code      │          │
//! │          │                │ otherwise: u8 len + UTF-8    │          │
//! └──────────┴────────────────┴──────────────────────────────┴──────────┘
//! flag = kind << 1 | compressed
//! ```
//! The id varint is little-endian base-128: seven payload bits per byte, high bit
//! set on every byte except the last.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Error, Result};

/// Messages shorter than this are rejected on decode.
pub const MIN_MESSAGE_LEN: usize = 4;

/// Longest route string a single length byte can describe.
pub const MAX_ROUTE_LEN: usize = u8::MAX as usize;

const KIND_MASK: u8 = 0x07;
const COMPRESS_MASK: u8 = 0x01;
const MAX_VARINT_LEN: usize = 10;

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageKind {
    /// Request and response messages carry a correlation id.
    pub fn has_id(self) -> bool {
        matches!(self, MessageKind::Request | MessageKind::Response)
    }

    /// Everything except a response names its route.
    pub fn has_route(self) -> bool {
        !matches!(self, MessageKind::Response)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Notify),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Push),
            other => Err(Error::decode(format!("unknown message kind {}", other))),
        }
    }
}

/// Route as carried on the wire: a dotted string or a dictionary code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Name(String),
    Code(u16),
}

impl Route {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Route::Code(_))
    }
}

/// Decoded message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Correlation id; 0 for kinds without one.
    pub id: u64,
    /// `None` exactly when `kind` is RESPONSE.
    pub route: Option<Route>,
    pub body: Bytes,
}

impl Message {
    pub fn request(id: u64, route: Route, body: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            route: Some(route),
            body: body.into(),
        }
    }

    pub fn notify(route: Route, body: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Notify,
            id: 0,
            route: Some(route),
            body: body.into(),
        }
    }

    pub fn response(id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            route: None,
            body: body.into(),
        }
    }

    pub fn push(route: Route, body: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Push,
            id: 0,
            route: Some(route),
            body: body.into(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.route.as_ref().is_some_and(Route::is_compressed)
    }

    /// Encode into a packet body.
    ///
    /// Fails when the result would be shorter than [`MIN_MESSAGE_LEN`], since
    /// [`Message::decode`] could not read it back.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.body.len() + 16);

        let mut flag = (self.kind as u8) << 1;
        if self.kind.has_route() && self.is_compressed() {
            flag |= COMPRESS_MASK;
        }
        buf.put_u8(flag);

        if self.kind.has_id() {
            put_varint(&mut buf, self.id);
        }

        if self.kind.has_route() {
            match &self.route {
                Some(Route::Code(code)) => buf.put_u16(*code),
                Some(Route::Name(name)) => {
                    if name.is_empty() {
                        return Err(Error::encode("empty route"));
                    }
                    if name.len() > MAX_ROUTE_LEN {
                        return Err(Error::encode(format!(
                            "route is {} bytes, max {}",
                            name.len(),
                            MAX_ROUTE_LEN
                        )));
                    }
                    buf.put_u8(name.len() as u8);
                    buf.put_slice(name.as_bytes());
                }
                None => {
                    return Err(Error::encode(format!(
                        "{:?} message without a route",
                        self.kind
                    )))
                }
            }
        }

        buf.put_slice(&self.body);
        if buf.len() < MIN_MESSAGE_LEN {
            return Err(Error::encode(format!(
                "message is {} bytes, min {}",
                buf.len(),
                MIN_MESSAGE_LEN
            )));
        }
        Ok(buf.freeze())
    }

    /// Decode a packet body. Never panics on malformed input.
    pub fn decode(data: &Bytes) -> Result<Self> {
        if data.len() < MIN_MESSAGE_LEN {
            return Err(Error::decode(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let flag = data[0];
        let kind = MessageKind::try_from((flag >> 1) & KIND_MASK)?;
        let mut offset = 1;

        let mut id = 0;
        if kind.has_id() {
            let (value, used) = get_varint(&data[offset..])?;
            id = value;
            offset += used;
        }

        let mut route = None;
        if kind.has_route() {
            if flag & COMPRESS_MASK == COMPRESS_MASK {
                let raw = data
                    .get(offset..offset + 2)
                    .ok_or_else(|| Error::decode("truncated route code"))?;
                route = Some(Route::Code(u16::from_be_bytes([raw[0], raw[1]])));
                offset += 2;
            } else {
                let len = usize::from(
                    *data
                        .get(offset)
                        .ok_or_else(|| Error::decode("missing route length"))?,
                );
                offset += 1;
                if len == 0 {
                    return Err(Error::decode("empty route"));
                }
                let raw = data
                    .get(offset..offset + len)
                    .ok_or_else(|| Error::decode("truncated route"))?;
                let name = std::str::from_utf8(raw)
                    .map_err(|e| Error::decode(format!("route is not UTF-8: {}", e)))?;
                route = Some(Route::Name(name.to_string()));
                offset += len;
            }
        }

        Ok(Self {
            kind,
            id,
            route,
            body: data.slice(offset..),
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut n: u64) {
    loop {
        let b = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            buf.put_u8(b);
            break;
        }
        buf.put_u8(b | 0x80);
    }
}

/// Returns the value and the number of bytes it occupied.
fn get_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in data.iter().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(b & 0x7F);
        let shift = 7 * i as u32;
        if shift == 63 && bits > 1 {
            return Err(Error::decode("message id overflows u64"));
        }
        value |= bits << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        Err(Error::decode("message id varint too long"))
    } else {
        Err(Error::decode("truncated message id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn varint(n: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, n);
        buf.to_vec()
    }

    #[test]
    fn test_varint_zero_is_single_byte() {
        assert_eq!(varint(0), vec![0x00]);
    }

    #[test]
    fn test_varint_300() {
        let bytes = varint(300);
        assert_eq!(bytes, vec![0xAC, 0x02]);
        assert!(bytes[0] & 0x80 != 0);
        assert_eq!(get_varint(&bytes).unwrap(), (300, 2));
    }

    #[test]
    fn test_varint_max() {
        let bytes = varint(u64::MAX);
        assert_eq!(bytes.len(), MAX_VARINT_LEN);
        assert_eq!(get_varint(&bytes).unwrap(), (u64::MAX, MAX_VARINT_LEN));
    }

    #[test]
    fn test_varint_truncated_and_overlong() {
        assert!(get_varint(&[0x80, 0x80]).is_err());
        assert!(get_varint(&[0xFF; 11]).is_err());
    }

    #[test]
    fn test_push_encoding_layout() {
        let msg = Message::push(Route::Name("a.b.c".into()), &b"hi"[..]);
        let wire = msg.encode().unwrap();
        let mut expected = vec![0x06, 5];
        expected.extend_from_slice(b"a.b.c");
        expected.extend_from_slice(b"hi");
        assert_eq!(&wire[..], &expected[..]);
    }

    #[test]
    fn test_compressed_push_encoding_layout() {
        let msg = Message::push(Route::Code(0x0102), &b"zz"[..]);
        let wire = msg.encode().unwrap();
        assert_eq!(&wire[..], &[0x07, 0x01, 0x02, b'z', b'z']);
    }

    #[test]
    fn test_response_encoding_layout() {
        let msg = Message::response(300, &b"ok"[..]);
        let wire = msg.encode().unwrap();
        assert_eq!(&wire[..], &[0x04, 0xAC, 0x02, b'o', b'k']);
    }

    #[test]
    fn test_decode_request() {
        let mut raw = vec![0x00, 0x05, 16];
        raw.extend_from_slice(b"connector.Room.J");
        raw.extend_from_slice(b"{}");
        let msg = Message::decode(&Bytes::from(raw)).unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.id, 5);
        assert_eq!(msg.route, Some(Route::Name("connector.Room.J".into())));
        assert_eq!(&msg.body[..], b"{}");
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = Message::decode(&Bytes::from_static(&[0x06, 0x01, b'a'])).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_route() {
        let raw = Bytes::from_static(&[0x02, 0x20, b'a', b'b', b'c']);
        assert!(Message::decode(&raw).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = Bytes::from_static(&[0x0E, 0x00, 0x00, 0x00]);
        assert!(Message::decode(&raw).is_err());
    }

    #[test]
    fn test_decode_rejects_non_utf8_route() {
        let raw = Bytes::from_static(&[0x02, 0x02, 0xFF, 0xFE, 0x00]);
        assert!(Message::decode(&raw).is_err());
    }

    #[test]
    fn test_encode_rejects_long_route() {
        let msg = Message::push(Route::Name("x".repeat(256)), Bytes::new());
        assert!(matches!(msg.encode(), Err(Error::Encode(_))));
    }

    #[test]
    fn test_encode_rejects_messages_too_short_to_decode() {
        for msg in [
            Message::response(0, Bytes::new()),
            Message::response(7, &b"k"[..]),
            Message::notify(Route::Code(1), Bytes::new()),
        ] {
            assert!(matches!(msg.encode(), Err(Error::Encode(_))), "encoded {:?}", msg);
        }
        assert!(Message::response(7, &b"ok"[..]).encode().is_ok());
    }

    #[test]
    fn test_empty_route_name_is_rejected_both_ways() {
        let msg = Message::push(Route::Name(String::new()), &b"xyz"[..]);
        assert!(matches!(msg.encode(), Err(Error::Encode(_))));

        let raw = Bytes::from_static(&[0x06, 0x00, b'x', b'y']);
        assert!(matches!(Message::decode(&raw), Err(Error::Decode(_))));
    }

    #[test]
    fn test_exactly_one_route_form() {
        let named = Message::decode(
            &Message::notify(Route::Name("a.b.c".into()), &b"xy"[..]).encode().unwrap(),
        )
        .unwrap();
        assert!(!named.is_compressed());
        assert!(matches!(named.route, Some(Route::Name(ref s)) if !s.is_empty()));

        let coded = Message::decode(&Message::notify(Route::Code(9), &b"xy"[..]).encode().unwrap())
            .unwrap();
        assert!(coded.is_compressed());
        assert_eq!(coded.route, Some(Route::Code(9)));
    }

    fn arb_route() -> impl Strategy<Value = Route> {
        prop_oneof![
            "[a-z]{1,8}\\.[A-Z][a-z]{0,8}\\.[A-Z][a-z]{0,8}".prop_map(Route::Name),
            any::<u16>().prop_map(Route::Code),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let body = proptest::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from);
        prop_oneof![
            (any::<u64>(), arb_route(), body.clone()).prop_map(|(id, r, b)| Message::request(id, r, b)),
            (arb_route(), body.clone()).prop_map(|(r, b)| Message::notify(r, b)),
            (any::<u64>(), body.clone()).prop_map(|(id, b)| Message::response(id, b)),
            (arb_route(), body).prop_map(|(r, b)| Message::push(r, b)),
        ]
    }

    proptest! {
        #[test]
        fn decode_reverses_encode(msg in arb_message()) {
            match msg.encode() {
                Ok(wire) => {
                    prop_assert_eq!(Message::decode(&wire).unwrap(), msg);
                }
                Err(err) => {
                    prop_assert!(matches!(err, Error::Encode(_)));
                    prop_assert!(msg.body.len() < MIN_MESSAGE_LEN);
                }
            }
        }

        #[test]
        fn decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::decode(&Bytes::from(raw));
        }
    }
}
