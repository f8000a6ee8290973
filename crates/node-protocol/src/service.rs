//! Service connection codecs.
//!
//! After the connection header, a client sends plain frames (requests) and
//! the server answers each with one status byte followed by a frame: the
//! serialized response when the byte is `1`, a UTF-8 error text when `0`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use rn_domain::Error;

use crate::frame::FrameCodec;

/// One answer to a service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub ok: bool,
    pub payload: Bytes,
}

impl ServiceReply {
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: Bytes::from(message.into().into_bytes()),
        }
    }

    /// Error text of a failed reply (lossy for non-UTF-8 payloads).
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Server side: decodes request frames, encodes [`ServiceReply`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceServerCodec {
    frames: FrameCodec,
}

impl ServiceServerCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame_bytes),
        }
    }
}

impl Decoder for ServiceServerCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames.decode_eof(src)
    }
}

impl Encoder<ServiceReply> for ServiceServerCodec {
    type Error = Error;

    fn encode(&mut self, item: ServiceReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Validate before touching dst so a rejected reply leaves no partial byte.
        if item.payload.len() > self.frames.max_frame_bytes() {
            return Err(Error::ProtocolViolation(format!(
                "service reply of {} bytes exceeds maximum {}",
                item.payload.len(),
                self.frames.max_frame_bytes()
            )));
        }
        dst.put_u8(u8::from(item.ok));
        self.frames.encode(&item.payload[..], dst)
    }
}

/// Client side: encodes request frames, decodes [`ServiceReply`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceClientCodec {
    frames: FrameCodec,
}

impl ServiceClientCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame_bytes),
        }
    }
}

impl Decoder for ServiceClientCodec {
    type Item = ServiceReply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let ok = match src[0] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "invalid service status byte {other}"
                )))
            }
        };
        // Peek the frame behind the status byte without consuming it.
        let mut rest = src.split_off(1);
        match self.frames.decode(&mut rest) {
            Ok(Some(frame)) => {
                src.unsplit(rest);
                src.advance(1);
                Ok(Some(ServiceReply {
                    ok,
                    payload: frame.freeze(),
                }))
            }
            Ok(None) => {
                src.unsplit(rest);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(reply) => Ok(Some(reply)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::ProtocolViolation(
                "connection closed mid service reply".into(),
            )),
        }
    }
}

impl Encoder<Bytes> for ServiceClientCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.frames.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_wire_layout() {
        let mut server = ServiceServerCodec::new(64);
        let mut buf = BytesMut::new();
        server
            .encode(ServiceReply::success(&b"ab"[..]), &mut buf)
            .unwrap();
        assert_eq!(buf.as_ref(), &[1, 2, 0, 0, 0, b'a', b'b']);

        let mut client = ServiceClientCodec::new(64);
        let reply = client.decode(&mut buf).unwrap().unwrap();
        assert!(reply.ok);
        assert_eq!(reply.payload.as_ref(), b"ab");
        assert!(buf.is_empty());
    }

    #[test]
    fn failure_carries_text() {
        let mut server = ServiceServerCodec::new(64);
        let mut buf = BytesMut::new();
        server
            .encode(ServiceReply::failure("boom"), &mut buf)
            .unwrap();
        let reply = ServiceClientCodec::new(64).decode(&mut buf).unwrap().unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error_text(), "boom");
    }

    #[test]
    fn partial_reply_is_not_consumed() {
        let mut client = ServiceClientCodec::new(64);
        let mut buf = BytesMut::from(&[1u8, 3, 0, 0, 0, b'x'][..]);
        assert!(client.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
        buf.extend_from_slice(b"yz");
        let reply = client.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.payload.as_ref(), b"xyz");
    }

    #[test]
    fn bad_status_byte_and_oversize_reply() {
        let mut client = ServiceClientCodec::new(64);
        let mut buf = BytesMut::from(&[7u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            client.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));

        let mut server = ServiceServerCodec::new(4);
        let mut out = BytesMut::new();
        assert!(server
            .encode(ServiceReply::success(vec![0u8; 5]), &mut out)
            .is_err());
        assert!(out.is_empty());
    }
}
