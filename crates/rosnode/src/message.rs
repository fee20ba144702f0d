// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message traits and the ROS1 serialization primitives.
//!
//! Message types themselves come from a build-time generator; the runtime only
//! needs the contract below: a stable type name, the md5sum of the schema, and
//! a serialize/deserialize pair. All integers on the wire are little-endian,
//! strings and variable arrays carry a `u32` length prefix, and nested
//! messages are inlined without framing.
//!
//! ```text
//! +----------------+------------------------------+
//! | u32 length LE  | field bytes (inline, packed) |
//! +----------------+------------------------------+
//! ```
//!
//! The outer length prefix is added by the connection, not by [`RosMessage`].

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// ============================================================================
// Time
// ============================================================================

/// ROS wall-clock time stamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Time {
    /// Seconds since the Unix epoch
    pub sec: u32,
    /// Nanoseconds within the second
    pub nsec: u32,
}

impl Time {
    /// Zero time stamp.
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// Create a time stamp from parts.
    pub fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as u32,
            nsec: d.subsec_nanos(),
        }
    }

    /// True for the zero stamp.
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Total nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        u64::from(self.sec) * 1_000_000_000 + u64::from(self.nsec)
    }

    /// Seconds as a float.
    pub fn to_sec(&self) -> f64 {
        f64::from(self.sec) + f64::from(self.nsec) * 1e-9
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

// ============================================================================
// Writer / Reader
// ============================================================================

/// Little-endian ROS1 serializer.
#[derive(Debug, Default)]
pub struct RosWriter {
    buf: Vec<u8>,
}

impl RosWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the writer and return the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed string.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_time(&mut self, t: Time) {
        self.write_u32(t.sec);
        self.write_u32(t.nsec);
    }

    /// Append raw bytes (already serialized nested content).
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed sequence of nested messages.
    pub fn write_seq<T: RosMessage>(&mut self, items: &[T]) {
        self.write_u32(items.len() as u32);
        for item in items {
            item.encode(self);
        }
    }
}

/// Little-endian ROS1 deserializer over a borrowed buffer.
#[derive(Debug)]
pub struct RosReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RosReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Deserialization(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Deserialization(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn read_time(&mut self) -> Result<Time> {
        Ok(Time {
            sec: self.read_u32()?,
            nsec: self.read_u32()?,
        })
    }

    /// Everything left in the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn read_seq<T: RosMessage>(&mut self) -> Result<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            let before = self.pos;
            items.push(T::decode(self)?);
            // Zero-size elements never underflow, so bound the count by the
            // buffer instead.
            if self.pos == before && len > self.buf.len() {
                return Err(Error::Deserialization(format!(
                    "sequence of {} empty elements in a {} byte buffer",
                    len,
                    self.buf.len()
                )));
            }
        }
        Ok(items)
    }
}

// ============================================================================
// Message contract
// ============================================================================

/// `std_msgs/Header` as embedded at the top of stamped messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub seq: u32,
    pub stamp: Time,
    pub frame_id: String,
}

/// A message type usable on topics.
pub trait RosMessage: Send + Sync + Sized + 'static {
    /// Wire type name, e.g. `std_msgs/String`.
    fn msg_type() -> String;
    /// md5sum of the message schema.
    fn md5sum() -> String;
    /// Full message definition text (sent in the handshake).
    fn msg_definition() -> String {
        String::new()
    }
    /// Whether the first field is a `std_msgs/Header`.
    fn has_header() -> bool {
        false
    }
    /// Append the fields to `w`.
    fn encode(&self, w: &mut RosWriter);
    /// Read the fields from `r`.
    fn decode(r: &mut RosReader<'_>) -> Result<Self>;
    /// Mutable access to the embedded header, if any.
    fn header_mut(&mut self) -> Option<&mut MsgHeader> {
        None
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = RosWriter::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut RosReader::new(bytes))
    }
}

/// A service type: request/response pair sharing one md5sum.
pub trait RosService: Send + Sync + 'static {
    type Request: RosMessage;
    type Response: RosMessage;

    /// Service type name, e.g. `std_srvs/Trigger`.
    fn service_type() -> String;
    /// md5sum of the combined request/response schema.
    fn md5sum() -> String;
}

// ============================================================================
// Type-erased payload
// ============================================================================

type Serializer = Box<dyn Fn() -> Vec<u8> + Send + Sync>;

struct PayloadInner {
    message: Option<Arc<dyn Any + Send + Sync>>,
    serializer: Option<Serializer>,
    bytes: OnceLock<Arc<[u8]>>,
}

/// A message travelling through publications and subscriptions.
///
/// Holds either the typed message (intra-process path), the serialized bytes
/// (network path), or both. Serialization happens at most once and only when a
/// transport link or the latch actually needs the bytes.
#[derive(Clone)]
pub struct MessagePayload {
    inner: Arc<PayloadInner>,
}

impl MessagePayload {
    /// Wrap a typed message; bytes are produced lazily.
    pub fn from_message<M: RosMessage>(msg: Arc<M>) -> Self {
        let for_ser = msg.clone();
        let message: Arc<dyn Any + Send + Sync> = msg;
        Self {
            inner: Arc::new(PayloadInner {
                message: Some(message),
                serializer: Some(Box::new(move || for_ser.to_bytes())),
                bytes: OnceLock::new(),
            }),
        }
    }

    /// Wrap bytes received from the network.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::from(bytes));
        Self {
            inner: Arc::new(PayloadInner {
                message: None,
                serializer: None,
                bytes: cell,
            }),
        }
    }

    /// Serialized form (computed on first use).
    pub fn bytes(&self) -> Arc<[u8]> {
        self.inner
            .bytes
            .get_or_init(|| match &self.inner.serializer {
                Some(ser) => Arc::from(ser()),
                None => Arc::from(Vec::new()),
            })
            .clone()
    }

    /// True if the typed message is available without deserializing.
    pub fn has_message(&self) -> bool {
        self.inner.message.is_some()
    }

    /// Typed view: the original object when types match, else a decode.
    pub fn downcast<M: RosMessage>(&self) -> Result<Arc<M>> {
        if let Some(any) = &self.inner.message {
            if let Ok(msg) = any.clone().downcast::<M>() {
                return Ok(msg);
            }
        }
        M::from_bytes(&self.bytes()).map(Arc::new)
    }
}

/// A received message together with its delivery metadata.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub payload: MessagePayload,
    /// `callerid` of the publishing node.
    pub publisher: Arc<str>,
    pub receipt_time: Time,
}

impl MessageEvent {
    pub fn new(payload: MessagePayload, publisher: Arc<str>) -> Self {
        Self {
            payload,
            publisher,
            receipt_time: Time::now(),
        }
    }
}

impl fmt::Debug for MessagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePayload")
            .field("has_message", &self.has_message())
            .field("serialized", &self.inner.bytes.get().map(|b| b.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::StringMsg;

    #[test]
    fn test_time_ordering() {
        assert!(Time::new(1, 5) < Time::new(2, 0));
        assert!(Time::new(1, 5) > Time::new(1, 4));
        assert!(Time::ZERO.is_zero());
    }

    #[test]
    fn test_seq_of_empty_elements_is_bounded() {
        use crate::msgs::EmptyMsg;

        let huge = u32::MAX.to_le_bytes();
        let mut r = RosReader::new(&huge);
        assert!(matches!(r.read_seq::<EmptyMsg>(), Err(Error::Deserialization(_))));

        let mut r = RosReader::new(&[3, 0, 0, 0]);
        assert_eq!(r.read_seq::<EmptyMsg>().unwrap().len(), 3);

        let mut r = RosReader::new(&[0xff, 0xff, 0xff, 0xff, 1, 0, 0, 0]);
        assert!(r.read_seq::<StringMsg>().is_err());
    }

    #[test]
    fn test_reader_underflow() {
        let mut r = RosReader::new(&[1, 2]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_string_wire_layout() {
        let mut w = RosWriter::new();
        w.write_string("hi");
        assert_eq!(w.into_bytes(), vec![2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_payload_lazy_bytes() {
        let payload = MessagePayload::from_message(Arc::new(StringMsg::new("abc")));
        assert!(payload.has_message());
        assert_eq!(&payload.bytes()[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_payload_downcast_from_bytes() {
        let payload = MessagePayload::from_bytes(StringMsg::new("net").to_bytes());
        let msg = payload.downcast::<StringMsg>().unwrap();
        assert_eq!(msg.data, "net");
    }
}
