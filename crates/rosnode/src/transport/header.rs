// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCPROS connection header codec.
//!
//! The header is exchanged once at the start of every connection:
//!
//! ```text
//! +---------------+------------------+---------------+------------------+
//! | u32 len (LE)  | "key=value"      | u32 len (LE)  | "key=value"  ... |
//! +---------------+------------------+---------------+------------------+
//! ```
//!
//! The block itself is preceded by its total length, written by
//! [`Connection::write_header`](super::Connection::write_header).

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Decoded header fields. Sorted so encoding is deterministic.
pub type HeaderMap = BTreeMap<String, String>;

/// Size of each length prefix.
pub const FIELD_LEN_SIZE: usize = 4;

/// Well-known header keys.
pub mod keys {
    pub const CALLERID: &str = "callerid";
    pub const TOPIC: &str = "topic";
    pub const SERVICE: &str = "service";
    pub const MD5SUM: &str = "md5sum";
    pub const TYPE: &str = "type";
    pub const REQUEST_TYPE: &str = "request_type";
    pub const RESPONSE_TYPE: &str = "response_type";
    pub const LATCHING: &str = "latching";
    pub const MESSAGE_DEFINITION: &str = "message_definition";
    pub const TCP_NODELAY: &str = "tcp_nodelay";
    pub const PERSISTENT: &str = "persistent";
    pub const PROBE: &str = "probe";
    pub const ERROR: &str = "error";
}

/// Parse a header block (without its outer length prefix).
///
/// Every field must contain `=` and the field lengths must add up to exactly
/// `buf.len()`. Any violation aborts the whole parse.
pub fn parse(buf: &[u8]) -> Result<HeaderMap> {
    let mut fields = HeaderMap::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        if buf.len() - pos < FIELD_LEN_SIZE {
            return Err(Error::Connection(format!(
                "truncated field length at offset {} of {}",
                pos,
                buf.len()
            )));
        }
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += FIELD_LEN_SIZE;

        if len > buf.len() - pos {
            return Err(Error::Connection(format!(
                "field of {} bytes overruns header ({} bytes left)",
                len,
                buf.len() - pos
            )));
        }

        let line = std::str::from_utf8(&buf[pos..pos + len])
            .map_err(|_| Error::Connection("header field is not valid UTF-8".into()))?;
        pos += len;

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Connection(format!("header field without '=': {:?}", line)))?;
        fields.insert(key.to_string(), value.to_string());
    }

    Ok(fields)
}

/// Encode header fields (without the outer length prefix).
pub fn write(fields: &HeaderMap) -> Vec<u8> {
    let total: usize = fields
        .iter()
        .map(|(k, v)| FIELD_LEN_SIZE + k.len() + 1 + v.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for (key, value) in fields {
        let len = (key.len() + 1 + value.len()) as u32;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Build a header from `(key, value)` pairs.
pub fn from_pairs<'a, I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderMap {
        from_pairs([
            (keys::TOPIC, "/chatter".to_string()),
            (keys::MD5SUM, "992ce8a1687cec8c8bd883ec73ca41d1".to_string()),
            (keys::TYPE, "std_msgs/String".to_string()),
            (keys::CALLERID, "/talker".to_string()),
        ])
    }

    #[test]
    fn test_roundtrip() {
        let fields = sample();
        let bytes = write(&fields);
        assert_eq!(parse(&bytes).unwrap(), fields);
    }

    #[test]
    fn test_roundtrip_random_fields() {
        for _ in 0..50 {
            let mut fields = HeaderMap::new();
            for _ in 0..fastrand::usize(0..8) {
                let key: String = (0..fastrand::usize(1..10))
                    .map(|_| fastrand::alphanumeric())
                    .collect();
                // Values may contain '=', keys may not.
                let value: String = (0..fastrand::usize(0..20))
                    .map(|_| if fastrand::u8(0..10) == 0 { '=' } else { fastrand::alphanumeric() })
                    .collect();
                fields.insert(key, value);
            }
            assert_eq!(parse(&write(&fields)).unwrap(), fields);
        }
    }

    #[test]
    fn test_value_with_equals_splits_once() {
        let mut buf = Vec::new();
        let line = b"message_definition=int32 a=1";
        buf.extend_from_slice(&(line.len() as u32).to_le_bytes());
        buf.extend_from_slice(line);
        let fields = parse(&buf).unwrap();
        assert_eq!(fields["message_definition"], "int32 a=1");
    }

    #[test]
    fn test_field_without_equals_is_fatal() {
        let mut buf = write(&sample());
        let line = b"garbage";
        buf.extend_from_slice(&(line.len() as u32).to_le_bytes());
        buf.extend_from_slice(line);
        assert!(matches!(parse(&buf), Err(Error::Connection(_))));
    }

    #[test]
    fn test_field_overrun_is_fatal() {
        let mut buf = write(&sample());
        // Drop the last byte: final field now claims more than is left.
        buf.pop();
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn test_trailing_partial_length_is_fatal() {
        let mut buf = write(&sample());
        buf.extend_from_slice(&[1, 0]);
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn test_empty_header() {
        assert!(parse(&[]).unwrap().is_empty());
        assert!(write(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_write_is_deterministic() {
        let fields = sample();
        assert_eq!(write(&fields), write(&fields.clone()));
    }
}
