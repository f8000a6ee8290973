//! Length-prefixed framing: `u32 LE length` followed by exactly that many
//! payload bytes.  Used for both the connection header block and messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use rn_domain::Error;

const LEN_PREFIX: usize = 4;

/// Frame codec with an upper bound on payload size.
///
/// An oversized frame is a [`Error::ProtocolViolation`] in both directions:
/// the encoder refuses to write it, the decoder refuses to buffer it.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        if len > self.max_frame_bytes || len > u32::MAX as usize {
            return Err(Error::ProtocolViolation(format!(
                "frame of {len} bytes exceeds maximum {}",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(1 << 30)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.check_len(len)?;

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::ProtocolViolation(format!(
                "connection closed mid-frame ({} bytes buffered)",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&[u8]>>::encode(self, &item[..], dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_len(item.len())?;
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(item);
        Ok(())
    }
}

/// Frame a payload into a standalone buffer, enforcing `max_frame_bytes`.
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Bytes, Error> {
    let mut buf = BytesMut::new();
    FrameCodec::new(max_frame_bytes).encode(payload, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64;

    #[test]
    fn roundtrip_boundary_sizes() {
        for size in [0usize, 1, MAX - 1, MAX] {
            let payload = vec![0xAB; size];
            let mut codec = FrameCodec::new(MAX);
            let mut buf = BytesMut::new();
            codec.encode(payload.as_slice(), &mut buf).unwrap();
            assert_eq!(buf.len(), 4 + size);
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.as_ref(), payload.as_slice());
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn one_byte_over_is_rejected_without_output() {
        let payload = vec![0u8; MAX + 1];
        let mut codec = FrameCodec::new(MAX);
        let mut buf = BytesMut::new();
        let err = codec.encode(payload.as_slice(), &mut buf).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(buf.is_empty());
        assert!(encode_frame(&payload, MAX).is_err());
    }

    #[test]
    fn oversized_incoming_prefix_is_violation() {
        let mut codec = FrameCodec::new(MAX);
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new(MAX);
        let mut buf = BytesMut::new();
        buf.put_u32_le(5);
        buf.extend_from_slice(b"hel");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn truncated_frame_at_eof_is_violation() {
        let mut codec = FrameCodec::new(MAX);
        let mut buf = BytesMut::new();
        buf.put_u32_le(5);
        buf.extend_from_slice(b"he");
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn little_endian_prefix() {
        let framed = encode_frame(b"abc", MAX).unwrap();
        assert_eq!(framed.as_ref(), &[3, 0, 0, 0, b'a', b'b', b'c']);
    }
}
