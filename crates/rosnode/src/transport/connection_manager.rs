// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection manager for TCPROS.
//!
//! Owns the TCPROS listener and the registry of every live connection:
//! - Inbound accept and header-based routing (topic vs service)
//! - Outbound connect with id allocation
//! - Lazy reconciliation of dropped connections
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                   ConnectionManager                         |
//! |  +-------------------------------------------------------+  |
//! |  |  connections: HashMap<u64, Arc<Connection>>           |  |
//! |  +-------------------------------------------------------+  |
//! |  +-------------------------------------------------------+  |
//! |  |  dropped: channel<u64>  (filled by drop_connection)   |  |
//! |  +-------------------------------------------------------+  |
//! |           ^ reconciled every poll tick                      |
//! |  accept thread ---> handler thread ---> TopicManager       |
//! |                                    \--> ServiceManager     |
//! +-------------------------------------------------------------+
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::connection::{CancelToken, Connection};
use super::header::keys;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::service::ServiceManager;
use crate::topic::TopicManager;

/// Accept poll period (also the reconciliation tick).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed for a peer to send its header after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Routes {
    topics: Weak<TopicManager>,
    services: Weak<ServiceManager>,
}

pub struct ConnectionManager {
    listen_addr: SocketAddr,
    advertise_host: String,
    connect_timeout: Duration,
    max_message_size: usize,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    drop_tx: Sender<u64>,
    drop_rx: Receiver<u64>,
    routes: OnceLock<Routes>,
    running: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Bind the TCPROS listener and start accepting.
    pub fn start(config: &NodeConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(SocketAddr::new(config.bind_ip, config.tcpros_port))?;
        listener.set_nonblocking(true)?;
        let listen_addr = listener.local_addr()?;
        let (drop_tx, drop_rx) = channel::unbounded();

        let mgr = Arc::new(Self {
            listen_addr,
            advertise_host: config.advertise_host.clone(),
            connect_timeout: config.connect_timeout,
            max_message_size: config.max_message_size,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            drop_tx,
            drop_rx,
            routes: OnceLock::new(),
            running: AtomicBool::new(true),
            accept_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&mgr);
        let handle = thread::Builder::new()
            .name("rosnode-tcpros-accept".into())
            .spawn(move || accept_loop(listener, weak))?;
        *mgr.accept_thread.lock() = Some(handle);

        log::debug!("[tcpros] listening on {}", listen_addr);
        Ok(mgr)
    }

    /// Install the managers inbound connections are routed to.
    pub fn set_routes(&self, topics: Weak<TopicManager>, services: Weak<ServiceManager>) {
        let _ = self.routes.set(Routes { topics, services });
    }

    pub fn tcpros_port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// Host advertised in `requestTopic` replies and service URIs.
    pub fn advertise_host(&self) -> &str {
        &self.advertise_host
    }

    /// Allocate an id (also used for intraprocess links).
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn register(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        self.connections.lock().insert(conn.id(), conn.clone());
        conn
    }

    /// Open an outbound TCPROS connection.
    pub fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        let conn = Connection::connect(
            self.next_id(),
            host,
            port,
            self.connect_timeout,
            self.max_message_size,
            Some(self.drop_tx.clone()),
        )?;
        log::debug!("[tcpros] connected to {}:{} (conn {})", host, port, conn.id());
        Ok(self.register(conn))
    }

    /// Number of live (not yet reconciled) connections.
    pub fn connection_count(&self) -> usize {
        self.reconcile();
        self.connections.lock().len()
    }

    /// Forget connections that reported a drop.
    fn reconcile(&self) {
        let dropped: Vec<u64> = self.drop_rx.try_iter().collect();
        if dropped.is_empty() {
            return;
        }
        let mut conns = self.connections.lock();
        for id in dropped {
            conns.remove(&id);
        }
    }

    /// Route a freshly accepted connection by its header.
    fn handle_inbound(&self, conn: Arc<Connection>) {
        let cancel = CancelToken::new();
        let header = match conn
            .read_header(&cancel)
            .and_then(|h| conn.set_read_timeout(None).map(|_| h))
        {
            Ok(h) => h,
            Err(e) => {
                log::debug!("[tcpros] handshake from {} failed: {}", conn.remote_addr(), e);
                conn.drop_connection("handshake failed");
                return;
            }
        };

        let routes = self.routes.get();
        if header.contains_key(keys::TOPIC) {
            match routes.and_then(|r| r.topics.upgrade()) {
                Some(topics) => topics.handle_subscriber_connection(conn, header),
                None => reject(&conn, "node is shutting down", &cancel),
            }
        } else if header.contains_key(keys::SERVICE) {
            match routes.and_then(|r| r.services.upgrade()) {
                Some(services) => services.handle_client_connection(conn, header),
                None => reject(&conn, "node is shutting down", &cancel),
            }
        } else {
            reject(
                &conn,
                "header must contain either a 'topic' or a 'service' field",
                &cancel,
            );
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        let conns: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.drop_connection("node shutdown");
        }
        log::debug!("[tcpros] connection manager stopped");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("listen_addr", &self.listen_addr)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

/// Answer with an `error` header, then close.
pub(crate) fn reject(conn: &Connection, message: &str, cancel: &CancelToken) {
    log::debug!("[tcpros] rejecting {}: {}", conn.remote_addr(), message);
    let _ = conn.send_header_error(message, cancel);
    conn.drop_connection(message);
}

fn accept_loop(listener: TcpListener, mgr: Weak<ConnectionManager>) {
    loop {
        let mgr = match mgr.upgrade() {
            Some(m) if m.is_running() => m,
            _ => return,
        };
        mgr.reconcile();

        match listener.accept() {
            Ok((stream, peer)) => {
                let accepted = stream
                    .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
                    .map_err(Error::from)
                    .and_then(|_| {
                        Connection::new(
                            mgr.next_id(),
                            stream,
                            mgr.max_message_size,
                            Some(mgr.drop_tx.clone()),
                        )
                    });
                let conn = match accepted {
                    Ok(c) => mgr.register(c),
                    Err(e) => {
                        log::debug!("[tcpros] dropping inbound {}: {}", peer, e);
                        continue;
                    }
                };
                let handler_mgr = mgr.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rosnode-tcpros-{}", conn.id()))
                    .spawn(move || handler_mgr.handle_inbound(conn));
                if let Err(e) = spawned {
                    log::warn!("[tcpros] failed to spawn handler thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                drop(mgr);
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                log::debug!("[tcpros] accept failed: {}", e);
                drop(mgr);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::header;

    #[test]
    fn test_connect_and_reconcile() {
        let mgr = ConnectionManager::start(&NodeConfig::loopback("http://127.0.0.1:1/")).unwrap();
        let port = mgr.tcpros_port();
        let conn = mgr.connect("127.0.0.1", port).unwrap();
        // Outbound + accepted side.
        thread::sleep(Duration::from_millis(50));
        assert!(mgr.connection_count() >= 1);

        // No routes installed: the peer is told why and dropped.
        let cancel = CancelToken::new();
        let fields = header::from_pairs([(keys::TOPIC, "/chatter".to_string())]);
        conn.write_header(&fields, &cancel).unwrap();
        match conn.read_header(&cancel) {
            Err(Error::Connection(msg)) => assert!(msg.contains("shutting down")),
            other => panic!("unexpected: {:?}", other),
        }

        conn.drop_connection("test done");
        thread::sleep(Duration::from_millis(250));
        assert_eq!(mgr.connection_count(), 0);
        mgr.shutdown();
        assert!(matches!(mgr.connect("127.0.0.1", port), Err(Error::Shutdown)));
    }

    #[test]
    fn test_header_without_topic_or_service_rejected() {
        let mgr = ConnectionManager::start(&NodeConfig::loopback("http://127.0.0.1:1/")).unwrap();
        let conn = mgr.connect("127.0.0.1", mgr.tcpros_port()).unwrap();
        let cancel = CancelToken::new();
        let fields = header::from_pairs([(keys::CALLERID, "/probe".to_string())]);
        conn.write_header(&fields, &cancel).unwrap();
        match conn.read_header(&cancel) {
            Err(Error::Connection(msg)) => assert!(msg.contains("topic")),
            other => panic!("unexpected: {:?}", other),
        }
        mgr.shutdown();
    }
}
