// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCPROS connection.
//!
//! A [`Connection`] owns one TCP socket and provides the length-prefixed
//! primitives every TCPROS exchange is built from:
//!
//! ```text
//!      +-----------+
//!      | Handshake |  write_header / read_header
//!      +-----+-----+
//!            | headers exchanged
//!            v
//!      +-----------+
//!      |   Data    |  read_block / write_block (u32 length + payload)
//!      +-----+-----+
//!            | error, EOF, cancel, drop_connection()
//!            v
//!      +-----------+
//!      |  Dropped  |  socket shut down, manager notified
//!      +-----------+
//! ```
//!
//! All sockets are blocking. Cancellation is forced: a [`CancelToken`] shuts
//! down every socket registered with it, so a thread blocked in `read` wakes
//! up with an error instead of hanging.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use super::header::{self, keys, HeaderMap};
use crate::error::{Error, Result};

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Default)]
struct CancelInner {
    cancelled: bool,
    /// Registered sockets and the number of operations using each.
    streams: HashMap<u64, (TcpStream, usize)>,
}

/// Cooperative cancellation with forced socket close.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<CancelInner>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel: shut down every registered socket. Idempotent.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        for (_, (stream, _)) in inner.streams.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Register `stream` for the duration of one operation. Overlapping
    /// operations on one socket share a counted registration.
    fn register(&self, id: u64, stream: &TcpStream) -> Result<CancelGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return Err(Error::Cancelled);
        }
        match inner.streams.get_mut(&id) {
            Some((_, users)) => *users += 1,
            None => {
                inner.streams.insert(id, (stream.try_clone()?, 1));
            }
        }
        Ok(CancelGuard { token: self, id })
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct CancelGuard<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.token.inner.lock();
        if let Some((_, users)) = inner.streams.get_mut(&self.id) {
            *users -= 1;
            if *users == 0 {
                inner.streams.remove(&self.id);
            }
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Byte/message counters for one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
}

// ============================================================================
// Connection
// ============================================================================

/// One TCPROS socket.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_message_size: usize,
    /// Serializes writers so blocks never interleave.
    write_lock: Mutex<()>,
    dropped: AtomicBool,
    drop_reason: Mutex<Option<String>>,
    remote_header: Mutex<HeaderMap>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    blocks_sent: AtomicU64,
    blocks_received: AtomicU64,
    drop_notify: Option<Sender<u64>>,
}

impl Connection {
    /// Wrap an established stream.
    pub fn new(
        id: u64,
        stream: TcpStream,
        max_message_size: usize,
        drop_notify: Option<Sender<u64>>,
    ) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
            log::debug!("[conn {}] keepalive not set: {}", id, e);
        }
        Ok(Self {
            id,
            stream,
            remote_addr,
            max_message_size,
            write_lock: Mutex::new(()),
            dropped: AtomicBool::new(false),
            drop_reason: Mutex::new(None),
            remote_header: Mutex::new(HeaderMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            blocks_sent: AtomicU64::new(0),
            blocks_received: AtomicU64::new(0),
            drop_notify,
        })
    }

    /// Open an outbound connection to `host:port`.
    pub fn connect(
        id: u64,
        host: &str,
        port: u16,
        timeout: Duration,
        max_message_size: usize,
        drop_notify: Option<Sender<u64>>,
    ) -> Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::new(id, stream, max_message_size, drop_notify),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::Connection(format!("no address for {}:{}", host, port)),
        })
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// `host:port` of the peer, as shown in bus info.
    pub fn remote_string(&self) -> String {
        self.remote_addr.to_string()
    }

    /// Header received from the peer (empty before the handshake).
    pub fn remote_header(&self) -> HeaderMap {
        self.remote_header.lock().clone()
    }

    /// `callerid` from the peer header.
    pub fn callerid(&self) -> Option<String> {
        self.remote_header.lock().get(keys::CALLERID).cloned()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn drop_reason(&self) -> Option<String> {
        self.drop_reason.lock().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
        }
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.stream.set_nodelay(nodelay)?;
        Ok(())
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Read and parse the peer header.
    ///
    /// Fails with [`Error::Connection`] if the peer sent an `error` field.
    pub fn read_header(&self, cancel: &CancelToken) -> Result<HeaderMap> {
        let block = self.read_length_prefixed(cancel)?;
        let fields = header::parse(&block)?;

        if let Some(err) = fields.get(keys::ERROR) {
            return Err(Error::Connection(format!(
                "remote error during handshake: {}",
                err
            )));
        }
        if fields.get(keys::TCP_NODELAY).map(String::as_str) == Some("1") {
            if let Err(e) = self.set_nodelay(true) {
                log::debug!("[conn {}] failed to set TCP_NODELAY: {}", self.id, e);
            }
        }

        *self.remote_header.lock() = fields.clone();
        Ok(fields)
    }

    /// Encode and send a header.
    pub fn write_header(&self, fields: &HeaderMap, cancel: &CancelToken) -> Result<()> {
        self.write_length_prefixed(&header::write(fields), cancel)
    }

    /// Send a header containing only `error=message`.
    pub fn send_header_error(&self, message: &str, cancel: &CancelToken) -> Result<()> {
        let fields = header::from_pairs([(keys::ERROR, message.to_string())]);
        self.write_header(&fields, cancel)
    }

    // ========================================================================
    // Block I/O
    // ========================================================================

    fn map_io(&self, e: io::Error, cancel: &CancelToken) -> Error {
        if cancel.is_cancelled() || self.is_dropped() {
            Error::Cancelled
        } else if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Connection("peer closed connection".into())
        } else {
            Error::Io(e)
        }
    }

    /// Read exactly `n` bytes.
    pub fn read_block(&self, n: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
        let _guard = cancel.register(self.id, &self.stream)?;
        let mut buf = vec![0u8; n];
        (&self.stream)
            .read_exact(&mut buf)
            .map_err(|e| self.map_io(e, cancel))?;
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        Ok(buf)
    }

    pub fn read_u8(&self, cancel: &CancelToken) -> Result<u8> {
        Ok(self.read_block(1, cancel)?[0])
    }

    pub fn read_u32(&self, cancel: &CancelToken) -> Result<u32> {
        let b = self.read_block(4, cancel)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_int32(&self, cancel: &CancelToken) -> Result<i32> {
        Ok(self.read_u32(cancel)? as i32)
    }

    /// Read a `u32` length then that many bytes, enforcing the size limit.
    pub fn read_length_prefixed(&self, cancel: &CancelToken) -> Result<Vec<u8>> {
        let len = self.read_u32(cancel)? as usize;
        if len > self.max_message_size {
            return Err(Error::MessageSizeLimit {
                size: len,
                limit: self.max_message_size,
            });
        }
        let block = self.read_block(len, cancel)?;
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Write raw bytes (no length prefix).
    pub fn write_block(&self, bytes: &[u8], cancel: &CancelToken) -> Result<()> {
        let _guard = cancel.register(self.id, &self.stream)?;
        let _w = self.write_lock.lock();
        (&self.stream)
            .write_all(bytes)
            .map_err(|e| self.map_io(e, cancel))?;
        self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write `u32 length ++ payload` as one block.
    pub fn write_length_prefixed(&self, payload: &[u8], cancel: &CancelToken) -> Result<()> {
        self.write_framed(&[], payload, cancel)
    }

    /// Write `prefix ++ u32 length ++ payload` as one block, e.g. a service
    /// reply with its leading ok byte.
    pub fn write_framed(&self, prefix: &[u8], payload: &[u8], cancel: &CancelToken) -> Result<()> {
        let mut frame = Vec::with_capacity(prefix.len() + 4 + payload.len());
        frame.extend_from_slice(prefix);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.write_block(&frame, cancel)?;
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close the socket and notify the manager. Only the first call has an
    /// effect.
    pub fn drop_connection(&self, reason: &str) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(
            "[conn {}] dropping connection to {}: {}",
            self.id,
            self.remote_addr,
            reason
        );
        *self.drop_reason.lock() = Some(reason.to_string());
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(tx) = &self.drop_notify {
            let _ = tx.send(self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_dropped() {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
