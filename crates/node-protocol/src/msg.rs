//! Payload serialization boundary.
//!
//! The transport moves opaque byte payloads.  Message types (normally
//! produced by a schema code generator) implement [`RosMessage`] to name
//! their schema and convert to and from those bytes.  A handful of
//! infrastructure messages the node itself needs are defined here.

use std::fmt;

use rn_domain::{Error, Result};

/// A message type that can cross a topic or service connection.
pub trait RosMessage: Sized + Send + Sync + 'static {
    /// Schema identifier, e.g. `"std_msgs/String"`.
    fn msg_type() -> String;
    /// Schema checksum both peers must agree on.
    fn md5sum() -> String;
    /// Full schema text, advertised in the publisher's connection header.
    fn message_definition() -> String {
        String::new()
    }

    fn encode(&self, w: &mut MessageWriter);
    fn decode(r: &mut MessageReader<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = MessageWriter::new();
        self.encode(&mut w);
        w.into_inner()
    }

    /// Decode a complete payload; trailing bytes are a decode error.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = MessageReader::new(bytes);
        let msg = Self::decode(&mut r)?;
        if r.remaining() != 0 {
            return Err(Error::Decode(format!(
                "{} trailing bytes after {}",
                r.remaining(),
                Self::msg_type()
            )));
        }
        Ok(msg)
    }
}

/// A request/response pair served over a service connection.
pub trait RosService: Send + Sync + 'static {
    type Request: RosMessage;
    type Response: RosMessage;

    /// Service schema identifier, e.g. `"std_srvs/Trigger"`.
    fn service_type() -> String;
    fn md5sum() -> String;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Little-endian primitive writer / reader
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `u32` length followed by UTF-8 bytes.
    pub fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    /// `u32` length followed by raw bytes.
    pub fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn time(&mut self, t: Time) {
        self.u32(t.secs);
        self.u32(t.nsecs);
    }

    /// `u32` element count followed by each element.
    pub fn seq<T>(&mut self, items: &[T], mut each: impl FnMut(&mut Self, &T)) {
        self.u32(items.len() as u32);
        for item in items {
            each(self, item);
        }
    }

    /// Append an already-encoded nested message.
    pub fn message<M: RosMessage>(&mut self, msg: &M) {
        msg.encode(self);
    }
}

#[derive(Debug)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Decode(format!(
                "needed {n} bytes, {} left",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Decode("string is not UTF-8".into()))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn time(&mut self) -> Result<Time> {
        Ok(Time {
            secs: self.u32()?,
            nsecs: self.u32()?,
        })
    }

    pub fn seq<T>(&mut self, mut each: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.u32()? as usize;
        // Each element is at least one byte; cap the preallocation accordingly.
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(each(self)?);
        }
        Ok(items)
    }

    pub fn message<M: RosMessage>(&mut self) -> Result<M> {
        M::decode(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Time
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Seconds + nanoseconds since the epoch (wall or simulated).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    pub secs: u32,
    pub nsecs: u32,
}

impl Time {
    pub const ZERO: Time = Time { secs: 0, nsecs: 0 };

    pub fn new(secs: u32, nsecs: u32) -> Self {
        Self::from_nanos(secs as u64 * NSEC_PER_SEC + nsecs as u64)
    }

    pub fn from_nanos(total: u64) -> Self {
        Self {
            secs: (total / NSEC_PER_SEC) as u32,
            nsecs: (total % NSEC_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.secs as u64 * NSEC_PER_SEC + self.nsecs as u64
    }

    pub fn is_zero(&self) -> bool {
        *self == Time::ZERO
    }

    /// Current wall-clock time.
    pub fn wall_now() -> Self {
        let now = chrono::Utc::now();
        Self {
            secs: now.timestamp().max(0) as u32,
            nsecs: now.timestamp_subsec_nanos().min(999_999_999),
        }
    }

    pub fn saturating_add(&self, d: std::time::Duration) -> Self {
        Self::from_nanos(self.as_nanos().saturating_add(d.as_nanos() as u64))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nsecs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `std_msgs/Header`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub seq: u32,
    pub stamp: Time,
    pub frame_id: String,
}

impl RosMessage for Header {
    fn msg_type() -> String {
        "std_msgs/Header".into()
    }
    fn md5sum() -> String {
        "2176decaecbce78abc3b96ef049fabed".into()
    }
    fn message_definition() -> String {
        "uint32 seq\ntime stamp\nstring frame_id\n".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.u32(self.seq);
        w.time(self.stamp);
        w.string(&self.frame_id);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            seq: r.u32()?,
            stamp: r.time()?,
            frame_id: r.string()?,
        })
    }
}

/// `std_msgs/String`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMsg {
    pub data: String,
}

impl StringMsg {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl RosMessage for StringMsg {
    fn msg_type() -> String {
        "std_msgs/String".into()
    }
    fn md5sum() -> String {
        "992ce8a1687cec8c8bd883ec73ca41d1".into()
    }
    fn message_definition() -> String {
        "string data\n".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.string(&self.data);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self { data: r.string()? })
    }
}

/// `rosgraph_msgs/Clock`, carried on `/clock` when simulated time is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    pub clock: Time,
}

impl RosMessage for Clock {
    fn msg_type() -> String {
        "rosgraph_msgs/Clock".into()
    }
    fn md5sum() -> String {
        "a9c97c1d230cfc112e270351a944ee47".into()
    }
    fn message_definition() -> String {
        "time clock\n".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.time(self.clock);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self { clock: r.time()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_msg_wire_format() {
        let bytes = StringMsg::new("hi").to_bytes();
        assert_eq!(bytes, vec![2, 0, 0, 0, b'h', b'i']);
        assert_eq!(StringMsg::from_bytes(&bytes).unwrap().data, "hi");
    }

    #[test]
    fn header_roundtrip() {
        let header = Header {
            seq: 42,
            stamp: Time::new(10, 5),
            frame_id: "base_link".into(),
        };
        assert_eq!(Header::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn truncated_payload_is_decode_error() {
        let err = StringMsg::from_bytes(&[5, 0, 0, 0, b'a']).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Clock::default().to_bytes();
        bytes.push(0);
        assert!(Clock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn time_normalizes_nanos() {
        let t = Time::new(1, 1_500_000_000);
        assert_eq!(t, Time { secs: 2, nsecs: 500_000_000 });
        assert_eq!(t.to_string(), "2.500000000");
        assert!(Time::ZERO.is_zero());
        assert!(Time::new(1, 0) < Time::new(1, 1));
    }

    #[test]
    fn seq_of_huge_declared_len_fails_cleanly() {
        let mut r = MessageReader::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(r.seq(|r| r.u8()).is_err());
    }
}
