//! Connection header exchanged once per peer connection before any payload.
//!
//! On the wire the header is one frame whose body is a sequence of
//! `u32 LE length` + `key=value` fields.  This module handles the body; the
//! outer length prefix is written and read by [`FrameCodec`](crate::frame::FrameCodec).

use rn_domain::{Error, Result};

/// Ordered `key=value` header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: Vec<(String, String)>,
}

impl ConnectionHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A rejection header carrying a single `error` field.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new().with("error", reason)
    }

    /// Add (or replace) a field; returns `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`get`](Self::get) but a missing field is a protocol violation.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::ProtocolViolation(format!("header missing field {key:?}")))
    }

    /// `Some(reason)` when the peer rejected the connection.
    pub fn rejection(&self) -> Option<&str> {
        self.get("error")
    }

    /// Boolean flags travel as `"1"` / `"0"`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true"))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode the header body (without the outer block length).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.fields {
            let len = key.len() + 1 + value.len();
            out.extend_from_slice(&(len as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// Decode a header body.  Field lengths that overrun the block, fields
    /// without `=`, and non-UTF-8 fields are protocol violations.
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        let mut header = Self::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(Error::ProtocolViolation(
                    "truncated header field length".into(),
                ));
            }
            let len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
            body = &body[4..];
            if len > body.len() {
                return Err(Error::ProtocolViolation(format!(
                    "header field length {len} overruns block ({} bytes left)",
                    body.len()
                )));
            }
            let (field, rest) = body.split_at(len);
            body = rest;

            let field = std::str::from_utf8(field)
                .map_err(|_| Error::ProtocolViolation("header field is not UTF-8".into()))?;
            let (key, value) = field.split_once('=').ok_or_else(|| {
                Error::ProtocolViolation(format!("header field {field:?} has no '='"))
            })?;
            header.set(key, value);
        }
        Ok(header)
    }
}

/// Compare an advertised schema value with the one a peer asked for.
/// `*` on either side matches anything.
pub fn schema_matches(ours: &str, theirs: &str) -> bool {
    ours == "*" || theirs == "*" || ours == theirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_order_and_values() {
        let header = ConnectionHeader::new()
            .with("callerid", "/listener")
            .with("topic", "/chatter")
            .with("md5sum", "992ce8a1687cec8c8bd883ec73ca41d1")
            .with("message_definition", "string data\nint32 x=1\n");
        let decoded = ConnectionHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.get("message_definition"), Some("string data\nint32 x=1\n"));
    }

    #[test]
    fn value_may_contain_equals() {
        let header = ConnectionHeader::new().with("k", "a=b=c");
        let decoded = ConnectionHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.get("k"), Some("a=b=c"));
    }

    #[test]
    fn known_wire_bytes() {
        let header = ConnectionHeader::new().with("a", "b");
        assert_eq!(header.encode(), vec![3, 0, 0, 0, b'a', b'=', b'b']);
    }

    #[test]
    fn overrunning_field_is_violation() {
        let body = [10u8, 0, 0, 0, b'a', b'=', b'b'];
        assert!(matches!(
            ConnectionHeader::decode(&body),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn field_without_equals_is_violation() {
        let body = [3u8, 0, 0, 0, b'a', b'b', b'c'];
        assert!(matches!(
            ConnectionHeader::decode(&body),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rejection_and_flags() {
        let rejected = ConnectionHeader::error("md5 mismatch");
        assert_eq!(rejected.rejection(), Some("md5 mismatch"));

        let header = ConnectionHeader::new().with("latching", "1").with("persistent", "0");
        assert!(header.flag("latching"));
        assert!(!header.flag("persistent"));
        assert!(!header.flag("absent"));
        assert!(header.require("absent").is_err());
    }

    #[test]
    fn wildcard_schema() {
        assert!(schema_matches("abc", "*"));
        assert!(schema_matches("*", "abc"));
        assert!(schema_matches("abc", "abc"));
        assert!(!schema_matches("abc", "abd"));
    }
}
