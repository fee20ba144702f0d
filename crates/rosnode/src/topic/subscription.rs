// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One subscribed topic.
//!
//! Tracks the publisher links feeding the topic, the registered callbacks and
//! the latched message of every latched link. The publisher list pushed by
//! the master (`publisherUpdate`) is diffed against connected and pending
//! URIs; new publishers are negotiated on their own thread:
//!
//! ```text
//! requestTopic(["TCPROS"]) --> ["TCPROS", host, port]
//!        |
//!        v
//! connect --> write header (callerid, topic, md5sum, type)
//!        |
//!        v
//! read header --> md5sum check / pin --> reader thread
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::publisher_link::{LocalPublisherLink, PublisherLink, TransportPublisherLink};
use super::subscriber_link::{LocalSubscriberLink, SubscriberLink};
use super::topic_manager::TopicManager;
use crate::callback_queue::{CallbackEntry, CallbackKind, CallbackQueue, MessageFn, OwnerId};
use crate::error::{Error, Result};
use crate::message::{MessageEvent, MessagePayload};
use crate::transport::header::{self, keys};
use crate::transport::{CancelToken, ConnectionManager};
use crate::xmlrpc::Value;
use crate::xmlrpc_manager::XmlRpcManager;

/// md5sum / type of a subscription that accepts anything until pinned.
pub const WILDCARD: &str = "*";

/// Delay before renegotiating a publisher whose link dropped.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Node services a subscription needs.
pub struct SubscriptionContext {
    pub node_name: String,
    pub xmlrpc: Arc<XmlRpcManager>,
    pub connections: Arc<ConnectionManager>,
    pub topics: Weak<TopicManager>,
}

// ============================================================================
// Callbacks
// ============================================================================

/// One registered callback and its delivery queue.
pub struct SubscriptionCallback {
    owner_id: OwnerId,
    deliver: MessageFn,
    queue: Arc<CallbackQueue>,
    queue_size: usize,
    allow_concurrent: bool,
    running: Arc<AtomicBool>,
    drops: AtomicU64,
}

impl SubscriptionCallback {
    pub fn new(
        owner_id: OwnerId,
        deliver: MessageFn,
        queue: Arc<CallbackQueue>,
        queue_size: usize,
        allow_concurrent: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            owner_id,
            deliver,
            queue,
            queue_size,
            allow_concurrent,
            running: Arc::new(AtomicBool::new(false)),
            drops: AtomicU64::new(0),
        })
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    /// Messages evicted from this callback's queue so far.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn enqueue(&self, event: MessageEvent) {
        let mut entry = CallbackEntry::new(
            self.owner_id,
            CallbackKind::Message {
                deliver: self.deliver.clone(),
                event,
            },
        );
        if !self.allow_concurrent {
            entry = entry.exclusive(self.running.clone());
        }
        if self.queue.add_callback(entry, self.queue_size) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Stats for one publisher link, as reported in `getBusStats`.
#[derive(Clone, Debug)]
pub struct SubscriptionLinkStats {
    pub id: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub connected: bool,
}

/// `getBusInfo` row.
#[derive(Clone, Debug)]
pub struct SubscriptionLinkInfo {
    pub id: u64,
    pub publisher_uri: String,
    pub transport: &'static str,
    pub info: String,
}

#[derive(Default)]
struct SubState {
    links: Vec<PublisherLink>,
    /// URIs with a negotiation in flight.
    pending: HashSet<String>,
    /// Publisher URIs from the latest master update.
    known: HashSet<String>,
    callbacks: Vec<Arc<SubscriptionCallback>>,
    /// Last message of each latched link.
    latched: HashMap<u64, (MessagePayload, Arc<str>)>,
}

pub struct Subscription {
    name: String,
    datatype: Mutex<String>,
    md5sum: Mutex<String>,
    tcp_nodelay: bool,
    ctx: Arc<SubscriptionContext>,
    shutting_down: AtomicBool,
    messages_received: AtomicU64,
    state: Mutex<SubState>,
}

impl Subscription {
    pub fn new(
        name: &str,
        datatype: &str,
        md5sum: &str,
        tcp_nodelay: bool,
        ctx: Arc<SubscriptionContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            datatype: Mutex::new(datatype.to_string()),
            md5sum: Mutex::new(md5sum.to_string()),
            tcp_nodelay,
            ctx,
            shutting_down: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            state: Mutex::new(SubState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> String {
        self.datatype.lock().clone()
    }

    pub fn md5sum(&self) -> String {
        self.md5sum.lock().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// True if `md5sum` is compatible with the current (possibly wildcard)
    /// one.
    pub fn accepts_md5(&self, md5sum: &str) -> bool {
        let current = self.md5sum.lock();
        current.as_str() == WILDCARD || md5sum == WILDCARD || current.as_str() == md5sum
    }

    /// Pin a wildcard md5sum/type to the first concrete values seen.
    /// Fails if already pinned to something else.
    pub fn pin(&self, md5sum: &str, datatype: &str) -> Result<()> {
        {
            let mut current = self.md5sum.lock();
            if current.as_str() == WILDCARD {
                if md5sum != WILDCARD {
                    *current = md5sum.to_string();
                }
            } else if md5sum != WILDCARD && current.as_str() != md5sum {
                return Err(Error::Md5Mismatch {
                    topic: self.name.clone(),
                    expected: current.clone(),
                    actual: md5sum.to_string(),
                });
            }
        }
        let mut dt = self.datatype.lock();
        if dt.as_str() == WILDCARD && datatype != WILDCARD && !datatype.is_empty() {
            *dt = datatype.to_string();
        }
        Ok(())
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Register a callback; it immediately receives every latched message.
    pub fn add_callback(&self, callback: Arc<SubscriptionCallback>) {
        let latched: Vec<(MessagePayload, Arc<str>)> = {
            let mut state = self.state.lock();
            state.callbacks.push(callback.clone());
            state.latched.values().cloned().collect()
        };
        for (payload, publisher) in latched {
            callback.enqueue(MessageEvent::new(payload, publisher));
        }
    }

    /// Remove a callback; returns how many remain.
    pub fn remove_callback(&self, owner_id: OwnerId) -> usize {
        let (removed, remaining) = {
            let mut state = self.state.lock();
            let removed: Vec<_> = state
                .callbacks
                .iter()
                .filter(|c| c.owner_id == owner_id)
                .cloned()
                .collect();
            state.callbacks.retain(|c| c.owner_id != owner_id);
            (removed, state.callbacks.len())
        };
        for cb in removed {
            cb.queue.remove_by_id(owner_id);
        }
        remaining
    }

    pub fn num_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Total messages evicted across callbacks.
    pub fn dropped_messages(&self) -> u64 {
        self.state.lock().callbacks.iter().map(|c| c.drops()).sum()
    }

    /// Dispatch a received message to every callback.
    pub fn handle_message(&self, payload: MessagePayload, link_id: u64, latched: bool, publisher: Arc<str>) {
        let callbacks = {
            let mut state = self.state.lock();
            if latched {
                state
                    .latched
                    .insert(link_id, (payload.clone(), publisher.clone()));
            }
            state.callbacks.clone()
        };
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        for cb in callbacks {
            cb.enqueue(MessageEvent::new(payload.clone(), publisher.clone()));
        }
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Publisher set
    // ========================================================================

    /// Reconcile the link set with the master's publisher list.
    pub fn pub_update(self: &Arc<Self>, uris: &[String]) {
        if self.is_shutting_down() {
            return;
        }
        let own_uri = self.ctx.xmlrpc.uri().to_string();

        let (to_drop, to_connect) = {
            let mut state = self.state.lock();
            state.known = uris.iter().cloned().collect();

            let mut to_drop = Vec::new();
            let mut kept = Vec::with_capacity(state.links.len());
            for link in state.links.drain(..) {
                if link.is_intraprocess() || uris.iter().any(|u| u == link.publisher_uri()) {
                    kept.push(link);
                } else {
                    to_drop.push(link);
                }
            }
            state.links = kept;
            for link in &to_drop {
                state.latched.remove(&link.id());
            }

            let connected: HashSet<String> = state
                .links
                .iter()
                .map(|l| l.publisher_uri().to_string())
                .collect();
            let mut to_connect = Vec::new();
            for uri in uris {
                if !connected.contains(uri) && !state.pending.contains(uri) {
                    state.pending.insert(uri.clone());
                    to_connect.push(uri.clone());
                }
            }
            (to_drop, to_connect)
        };

        for link in to_drop {
            link.close("publisher no longer registered");
        }
        for uri in to_connect {
            if uri == own_uri {
                self.connect_local(&uri);
            } else {
                self.spawn_negotiation(uri, Duration::ZERO);
            }
        }
    }

    fn spawn_negotiation(self: &Arc<Self>, uri: String, delay: Duration) {
        let sub = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("rosnode-negotiate-{}", self.name))
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                sub.negotiate(&uri);
            });
        if let Err(e) = spawned {
            log::warn!("[sub {}] cannot spawn negotiation thread: {}", self.name, e);
            self.state.lock().pending.clear();
        }
    }

    fn negotiate(self: &Arc<Self>, uri: &str) {
        let result = if self.is_shutting_down() {
            Err(Error::Shutdown)
        } else {
            self.connect_transport(uri)
        };

        let mut state = self.state.lock();
        state.pending.remove(uri);
        match result {
            Ok(link) => {
                if self.is_shutting_down() || !state.known.contains(uri) {
                    drop(state);
                    link.close("publisher no longer needed");
                    return;
                }
                state.links.push(PublisherLink::Transport(link.clone()));
                drop(state);
                if let Err(e) = link.start() {
                    log::warn!("[sub {}] cannot start reader: {}", self.name, e);
                    link.close("reader thread failed");
                    self.forget_link(link.id());
                }
            }
            Err(e) => {
                drop(state);
                log::warn!(
                    "[sub {}] negotiation with {} failed: {}",
                    self.name,
                    uri,
                    e
                );
            }
        }
    }

    /// `requestTopic` + TCPROS handshake with one publisher.
    fn connect_transport(self: &Arc<Self>, uri: &str) -> Result<Arc<TransportPublisherLink>> {
        let protocols = Value::Array(vec![Value::Array(vec![Value::from("TCPROS")])]);
        let payload = self.ctx.xmlrpc.call_checked(
            uri,
            "requestTopic",
            &[
                Value::from(self.ctx.node_name.as_str()),
                Value::from(self.name.as_str()),
                protocols,
            ],
        )?;

        let (host, port) = tcpros_endpoint(&payload)?;

        let conn = self.ctx.connections.connect(&host, port)?;
        let cancel = CancelToken::new();
        let mut fields = header::from_pairs([
            (keys::CALLERID, self.ctx.node_name.clone()),
            (keys::TOPIC, self.name.clone()),
            (keys::MD5SUM, self.md5sum()),
            (keys::TYPE, self.datatype()),
        ]);
        if self.tcp_nodelay {
            fields.insert(keys::TCP_NODELAY.to_string(), "1".to_string());
        }

        let handshake = conn.write_header(&fields, &cancel).and_then(|_| conn.read_header(&cancel));
        let remote = match handshake {
            Ok(h) => h,
            Err(e) => {
                conn.drop_connection("handshake failed");
                return Err(e);
            }
        };

        let md5 = remote.get(keys::MD5SUM).cloned().unwrap_or_default();
        let datatype = remote.get(keys::TYPE).cloned().unwrap_or_default();
        if md5.is_empty() {
            conn.drop_connection("publisher header without md5sum");
            return Err(Error::Connection("publisher header without md5sum".into()));
        }
        if let Err(e) = self.pin(&md5, &datatype) {
            conn.drop_connection("md5sum mismatch");
            return Err(e);
        }

        log::debug!(
            "[sub {}] connected to {} at {}:{}",
            self.name,
            remote.get(keys::CALLERID).map(String::as_str).unwrap_or("?"),
            host,
            port
        );
        Ok(TransportPublisherLink::new(conn, &self.name, uri, Arc::downgrade(self)))
    }

    /// Shortcut for a publisher living in this node.
    fn connect_local(self: &Arc<Self>, own_uri: &str) {
        let publication = self
            .ctx
            .topics
            .upgrade()
            .and_then(|t| t.lookup_publication(&self.name));
        let publication = match publication {
            Some(p) => p,
            None => {
                self.state.lock().pending.remove(own_uri);
                return;
            }
        };
        if let Err(e) = self.pin(publication.md5sum(), publication.datatype()) {
            log::error!("[sub {}] local publisher rejected: {}", self.name, e);
            self.state.lock().pending.remove(own_uri);
            return;
        }

        let id = self.ctx.connections.next_id();
        let node = self.ctx.node_name.as_str();
        let pub_link = LocalPublisherLink::new(id, own_uri, node, &publication);
        let sub_link = LocalSubscriberLink::new(id, node, Arc::downgrade(self), publication.is_latching());
        {
            let mut state = self.state.lock();
            state.pending.remove(own_uri);
            state.links.push(PublisherLink::Local(pub_link));
        }
        publication.add_subscriber_link(SubscriberLink::Local(sub_link));
        log::debug!("[sub {}] intraprocess link {} established", self.name, id);
    }

    /// Link to this node's own publication of the topic without waiting for
    /// a master update.
    pub fn add_local_publisher(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        let own_uri = self.ctx.xmlrpc.uri().to_string();
        {
            let mut state = self.state.lock();
            if state.pending.contains(&own_uri) || state.links.iter().any(|l| l.is_intraprocess()) {
                return;
            }
            state.pending.insert(own_uri.clone());
            state.known.insert(own_uri.clone());
        }
        self.connect_local(&own_uri);
    }

    fn forget_link(&self, id: u64) -> Option<PublisherLink> {
        let mut state = self.state.lock();
        state.latched.remove(&id);
        let pos = state.links.iter().position(|l| l.id() == id)?;
        Some(state.links.remove(pos))
    }

    /// Called by an intraprocess publisher going away.
    pub fn remove_publisher_link(&self, id: u64) {
        if let Some(link) = self.forget_link(id) {
            link.close("publisher removed");
        }
    }

    /// Called by a transport reader whose connection died.
    pub fn on_publisher_link_dropped(self: &Arc<Self>, id: u64, uri: &str) {
        self.forget_link(id);
        if self.is_shutting_down() {
            return;
        }
        let retry = {
            let mut state = self.state.lock();
            let retry = state.known.contains(uri) && !state.pending.contains(uri);
            if retry {
                state.pending.insert(uri.to_string());
            }
            retry
        };
        if retry {
            log::debug!("[sub {}] link to {} dropped, reconnecting", self.name, uri);
            self.spawn_negotiation(uri.to_string(), RECONNECT_DELAY);
        }
    }

    /// Close every link and drop every callback.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let (links, callbacks) = {
            let mut state = self.state.lock();
            state.latched.clear();
            state.pending.clear();
            state.known.clear();
            (
                std::mem::take(&mut state.links),
                std::mem::take(&mut state.callbacks),
            )
        };
        for link in links {
            link.close("subscription shut down");
        }
        for cb in callbacks {
            cb.queue.remove_by_id(cb.owner_id);
        }
        log::debug!("[sub {}] shut down", self.name);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn num_publishers(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Caller ids of connected publishers.
    pub fn publisher_names(&self) -> Vec<String> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| l.caller_id().to_string())
            .collect()
    }

    pub fn link_stats(&self) -> Vec<SubscriptionLinkStats> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| {
                let s = l.stats();
                SubscriptionLinkStats {
                    id: l.id(),
                    bytes_received: s.bytes_received,
                    messages_received: s.messages_received,
                    connected: true,
                }
            })
            .collect()
    }

    pub fn link_info(&self) -> Vec<SubscriptionLinkInfo> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| SubscriptionLinkInfo {
                id: l.id(),
                publisher_uri: l.publisher_uri().to_string(),
                transport: l.transport_name(),
                info: l.info(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("md5sum", &self.md5sum())
            .field("publishers", &self.num_publishers())
            .finish()
    }
}

/// Endpoint from a `requestTopic` reply payload `[protocol, host, port]`.
/// Only TCPROS is accepted.
fn tcpros_endpoint(payload: &Value) -> Result<(String, u16)> {
    match payload.as_array() {
        Some([Value::String(proto), Value::String(host), Value::Int(port)]) if proto == "TCPROS" => {
            let port = u16::try_from(*port).map_err(|_| Error::InvalidResponse {
                method: "requestTopic".into(),
                reason: format!("bad port {}", port),
            })?;
            Ok((host.clone(), port))
        }
        Some([Value::String(proto), ..]) => Err(Error::UnsupportedProtocol(proto.clone())),
        _ => Err(Error::InvalidResponse {
            method: "requestTopic".into(),
            reason: "expected [protocol, host, port]".into(),
        }),
    }
}
