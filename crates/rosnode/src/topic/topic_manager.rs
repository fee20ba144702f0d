// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node registry of publications and subscriptions.
//!
//! Owns the topic half of the slave API (`publisherUpdate`, `requestTopic`,
//! `getPublications`, `getSubscriptions`) and accepts inbound TCPROS
//! subscriber connections routed by the connection manager.
//!
//! ```text
//!   advertise ----> Publication (ref-counted) ---> registerPublisher
//!   subscribe ----> Subscription -----------------> registerSubscriber
//!                         ^                              |
//!                         +------ pub_update(uris) <-----+
//! ```
//!
//! Master calls always run outside the registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use super::publication::{Publication, SubscriberStatusCallbacks};
use super::subscriber_link::{SubscriberLink, TransportSubscriberLink};
use super::subscription::{Subscription, SubscriptionCallback, SubscriptionContext, WILDCARD};
use crate::callback_queue::{CallbackQueue, MessageFn, OwnerId};
use crate::error::{Error, Result};
use crate::master::Master;
use crate::transport::header::{self, keys, HeaderMap};
use crate::transport::{reject, CancelToken, Connection, ConnectionManager};
use crate::xmlrpc::Value;
use crate::xmlrpc_manager::{success, XmlRpcManager};

/// Everything needed to create or join a publication.
#[derive(Clone)]
pub struct AdvertiseOptions {
    pub topic: String,
    pub datatype: String,
    pub md5sum: String,
    pub message_definition: String,
    pub queue_size: usize,
    pub latch: bool,
    pub has_header: bool,
    pub callbacks: SubscriberStatusCallbacks,
}

/// Everything needed to create or join a subscription.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub topic: String,
    pub datatype: String,
    pub md5sum: String,
    pub queue_size: usize,
    pub tcp_nodelay: bool,
    pub allow_concurrent: bool,
    pub queue: Arc<CallbackQueue>,
    pub deliver: MessageFn,
}

struct Advertised {
    publication: Arc<Publication>,
    handles: usize,
}

/// An in-flight `registerSubscriber`. Other subscribers to the topic wait
/// for it instead of joining a subscription that may still be torn down.
#[derive(Default)]
struct PendingSubscribe {
    done: Mutex<bool>,
    cond: Condvar,
}

impl PendingSubscribe {
    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct Registry {
    publications: HashMap<String, Advertised>,
    subscriptions: HashMap<String, Arc<Subscription>>,
    pending_subscribes: HashMap<String, Arc<PendingSubscribe>>,
}

pub struct TopicManager {
    node_name: String,
    master: Arc<Master>,
    xmlrpc: Arc<XmlRpcManager>,
    connections: Arc<ConnectionManager>,
    queue: Arc<CallbackQueue>,
    sub_ctx: Arc<SubscriptionContext>,
    registry: Mutex<Registry>,
    shutting_down: AtomicBool,
}

impl TopicManager {
    pub fn new(
        node_name: &str,
        xmlrpc: Arc<XmlRpcManager>,
        master: Arc<Master>,
        connections: Arc<ConnectionManager>,
        queue: Arc<CallbackQueue>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TopicManager>| Self {
            node_name: node_name.to_string(),
            sub_ctx: Arc::new(SubscriptionContext {
                node_name: node_name.to_string(),
                xmlrpc: xmlrpc.clone(),
                connections: connections.clone(),
                topics: weak.clone(),
            }),
            master,
            xmlrpc,
            connections,
            queue,
            registry: Mutex::new(Registry::default()),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Advertise
    // ========================================================================

    /// Create the publication for `opts.topic`, or join the existing one.
    /// Only the first handle registers with the master.
    pub fn advertise(&self, opts: AdvertiseOptions, owner: OwnerId) -> Result<Arc<Publication>> {
        self.check_running()?;
        let publication = {
            let mut registry = self.registry.lock();
            if let Some(existing) = registry.publications.get_mut(&opts.topic) {
                let publication = existing.publication.clone();
                if publication.md5sum() != opts.md5sum {
                    return Err(Error::Md5Mismatch {
                        topic: opts.topic,
                        expected: publication.md5sum().to_string(),
                        actual: opts.md5sum,
                    });
                }
                existing.handles += 1;
                drop(registry);
                publication.add_status_callbacks(owner, opts.callbacks);
                return Ok(publication);
            }
            let publication = Publication::new(
                &opts.topic,
                &opts.datatype,
                &opts.md5sum,
                &opts.message_definition,
                opts.queue_size,
                opts.latch,
                opts.has_header,
                self.queue.clone(),
            );
            registry.publications.insert(
                opts.topic.clone(),
                Advertised {
                    publication: publication.clone(),
                    handles: 1,
                },
            );
            publication
        };
        publication.add_status_callbacks(owner, opts.callbacks);

        if let Err(e) = self.master.register_publisher(&opts.topic, &opts.datatype) {
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.publications.get(&opts.topic) {
                if Arc::ptr_eq(&entry.publication, &publication) {
                    registry.publications.remove(&opts.topic);
                }
            }
            drop(registry);
            publication.drop_publication();
            return Err(e);
        }
        log::info!(
            "[topics] advertised {} [{}]",
            opts.topic,
            opts.datatype
        );

        let local_sub = self.registry.lock().subscriptions.get(&opts.topic).cloned();
        if let Some(sub) = local_sub {
            sub.add_local_publisher();
        }
        Ok(publication)
    }

    /// Release one advertise handle. The last one unregisters.
    pub fn unadvertise(&self, topic: &str, owner: OwnerId) -> Result<()> {
        let last = {
            let mut registry = self.registry.lock();
            let entry = registry
                .publications
                .get_mut(topic)
                .ok_or_else(|| Error::NotAdvertised(topic.to_string()))?;
            entry.publication.remove_status_callbacks(owner);
            entry.handles = entry.handles.saturating_sub(1);
            if entry.handles == 0 {
                registry.publications.remove(topic).map(|e| e.publication)
            } else {
                None
            }
        };
        if let Some(publication) = last {
            publication.drop_publication();
            self.master.unregister_publisher(topic)?;
            log::info!("[topics] unadvertised {}", topic);
        }
        Ok(())
    }

    // ========================================================================
    // Subscribe
    // ========================================================================

    /// Add a callback for `opts.topic`, creating the subscription if needed.
    pub fn subscribe(&self, opts: SubscribeOptions, owner: OwnerId) -> Result<Arc<Subscription>> {
        self.check_running()?;
        let callback = SubscriptionCallback::new(
            owner,
            opts.deliver.clone(),
            opts.queue.clone(),
            opts.queue_size,
            opts.allow_concurrent,
        );

        let (subscription, pending) = loop {
            let mut registry = self.registry.lock();
            if let Some(existing) = registry.subscriptions.get(&opts.topic) {
                let existing = existing.clone();
                drop(registry);
                if !existing.accepts_md5(&opts.md5sum) {
                    return Err(Error::Md5Mismatch {
                        topic: opts.topic,
                        expected: existing.md5sum(),
                        actual: opts.md5sum,
                    });
                }
                existing.pin(&opts.md5sum, &opts.datatype)?;
                existing.add_callback(callback);
                return Ok(existing);
            }
            if let Some(pending) = registry.pending_subscribes.get(&opts.topic) {
                let pending = pending.clone();
                drop(registry);
                pending.wait();
                self.check_running()?;
                continue;
            }
            let subscription = Subscription::new(
                &opts.topic,
                &opts.datatype,
                &opts.md5sum,
                opts.tcp_nodelay,
                self.sub_ctx.clone(),
            );
            subscription.add_callback(callback);
            let pending = Arc::new(PendingSubscribe::default());
            registry
                .pending_subscribes
                .insert(opts.topic.clone(), pending.clone());
            break (subscription, pending);
        };

        let datatype = if opts.datatype.is_empty() {
            WILDCARD.to_string()
        } else {
            opts.datatype.clone()
        };
        let registered = self.master.register_subscriber(&opts.topic, &datatype);
        {
            let mut registry = self.registry.lock();
            registry.pending_subscribes.remove(&opts.topic);
            if registered.is_ok() {
                registry
                    .subscriptions
                    .insert(opts.topic.clone(), subscription.clone());
            }
        }
        pending.finish();
        let publishers = match registered {
            Ok(p) => p,
            Err(e) => {
                subscription.shutdown();
                return Err(e);
            }
        };
        if self.shutting_down.load(Ordering::Acquire) {
            subscription.shutdown();
            return Err(Error::Shutdown);
        }
        log::info!(
            "[topics] subscribed to {} ({} publisher(s))",
            opts.topic,
            publishers.len()
        );

        subscription.pub_update(&publishers);
        if self.lookup_publication(&opts.topic).is_some() {
            subscription.add_local_publisher();
        }
        Ok(subscription)
    }

    /// Remove `owner`'s callback; the last one unregisters.
    pub fn unsubscribe(&self, topic: &str, owner: OwnerId) -> Result<()> {
        let subscription = self
            .registry
            .lock()
            .subscriptions
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::NotAdvertised(topic.to_string()))?;
        if subscription.remove_callback(owner) > 0 {
            return Ok(());
        }
        {
            let mut registry = self.registry.lock();
            match registry.subscriptions.get(topic) {
                Some(current) if Arc::ptr_eq(current, &subscription) && subscription.num_callbacks() == 0 => {
                    registry.subscriptions.remove(topic);
                }
                _ => return Ok(()),
            }
        }
        subscription.shutdown();
        self.master.unregister_subscriber(topic)?;
        log::info!("[topics] unsubscribed from {}", topic);
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn lookup_publication(&self, topic: &str) -> Option<Arc<Publication>> {
        self.registry
            .lock()
            .publications
            .get(topic)
            .map(|a| a.publication.clone())
    }

    pub fn lookup_subscription(&self, topic: &str) -> Option<Arc<Subscription>> {
        self.registry.lock().subscriptions.get(topic).cloned()
    }

    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.lookup_publication(topic)
            .map(|p| p.num_subscribers())
            .unwrap_or(0)
    }

    pub fn num_publishers(&self, topic: &str) -> usize {
        self.lookup_subscription(topic)
            .map(|s| s.num_publishers())
            .unwrap_or(0)
    }

    /// `(topic, type)` for every advertised topic.
    pub fn get_publications(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .registry
            .lock()
            .publications
            .values()
            .map(|a| {
                (
                    a.publication.name().to_string(),
                    a.publication.datatype().to_string(),
                )
            })
            .collect();
        out.sort();
        out
    }

    /// `(topic, type)` for every subscribed topic.
    pub fn get_subscriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .registry
            .lock()
            .subscriptions
            .values()
            .map(|s| (s.name().to_string(), s.datatype()))
            .collect();
        out.sort();
        out
    }

    fn snapshot(&self) -> (Vec<Arc<Publication>>, Vec<Arc<Subscription>>) {
        let registry = self.registry.lock();
        (
            registry
                .publications
                .values()
                .map(|a| a.publication.clone())
                .collect(),
            registry.subscriptions.values().cloned().collect(),
        )
    }

    // ========================================================================
    // Inbound TCPROS
    // ========================================================================

    /// Finish the handshake of a subscriber that connected to us, then keep
    /// the calling thread watching the socket until the subscriber leaves.
    pub fn handle_subscriber_connection(&self, conn: Arc<Connection>, header: HeaderMap) {
        let cancel = CancelToken::new();
        let topic = header.get(keys::TOPIC).cloned().unwrap_or_default();
        let caller = header
            .get(keys::CALLERID)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let publication = match self.lookup_publication(&topic) {
            Some(p) if !p.is_dropped() => p,
            _ => {
                let msg = format!(
                    "received a connection for a nonexistent topic [{}] from [{}]",
                    topic, caller
                );
                reject(&conn, &msg, &cancel);
                return;
            }
        };

        let md5 = match header.get(keys::MD5SUM) {
            Some(m) => m.clone(),
            None => {
                reject(&conn, "header from subscriber did not have an md5sum", &cancel);
                return;
            }
        };
        if md5 != WILDCARD && publication.md5sum() != WILDCARD && md5 != publication.md5sum() {
            let msg = format!(
                "md5sums do not match: [{}] vs. [{}] on topic [{}] from [{}]",
                md5,
                publication.md5sum(),
                topic,
                caller
            );
            log::warn!("[topics] {}", msg);
            reject(&conn, &msg, &cancel);
            return;
        }

        let reply = header::from_pairs([
            (keys::CALLERID, self.node_name.clone()),
            (keys::TOPIC, topic.clone()),
            (keys::MD5SUM, publication.md5sum().to_string()),
            (keys::TYPE, publication.datatype().to_string()),
            (
                keys::LATCHING,
                if publication.is_latching() { "1" } else { "0" }.to_string(),
            ),
            (
                keys::MESSAGE_DEFINITION,
                publication.message_definition().to_string(),
            ),
        ]);
        if let Err(e) = conn.write_header(&reply, &cancel) {
            log::debug!("[topics] handshake reply to {} failed: {}", caller, e);
            conn.drop_connection("handshake reply failed");
            return;
        }

        let link = TransportSubscriberLink::new(
            conn,
            &topic,
            &caller,
            publication.max_queue(),
            Arc::downgrade(&publication),
        );
        if let Err(e) = link.start() {
            log::warn!("[topics] cannot start writer for {}: {}", caller, e);
            link.close("writer thread failed");
            return;
        }
        publication.add_subscriber_link(SubscriberLink::Transport(link.clone()));
        link.watch_peer();
    }

    // ========================================================================
    // Slave API
    // ========================================================================

    /// Bind the topic half of the slave API on the node's XML-RPC server.
    pub fn bind_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("publisherUpdate", move |params| {
            match weak.upgrade() {
                Some(tm) => tm.publisher_update(params),
                None => success("", Value::Int(0)),
            }
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("requestTopic", move |params| match weak.upgrade() {
            Some(tm) => tm.request_topic(params),
            None => Value::response(0, "node is shutting down", Value::Int(0)),
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("getPublications", move |_| {
            let list = weak
                .upgrade()
                .map(|tm| tm.get_publications())
                .unwrap_or_default();
            success("publications", pairs_value(list))
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("getSubscriptions", move |_| {
            let list = weak
                .upgrade()
                .map(|tm| tm.get_subscriptions())
                .unwrap_or_default();
            success("subscriptions", pairs_value(list))
        });
    }

    fn publisher_update(&self, params: &[Value]) -> Value {
        let (topic, uris) = match params {
            [_, Value::String(topic), list, ..] => match list.as_string_list() {
                Some(uris) => (topic.clone(), uris),
                None => return Value::response(-1, "publishers must be a list of strings", Value::Int(0)),
            },
            _ => return Value::response(-1, "expected [caller_id, topic, publishers]", Value::Int(0)),
        };
        log::debug!("[topics] publisherUpdate {} -> {:?}", topic, uris);
        if let Some(sub) = self.lookup_subscription(&topic) {
            sub.pub_update(&uris);
        }
        success("", Value::Int(0))
    }

    fn request_topic(&self, params: &[Value]) -> Value {
        let (caller, topic, protocols) = match params {
            [Value::String(caller), Value::String(topic), Value::Array(protocols), ..] => {
                (caller, topic, protocols)
            }
            _ => {
                return Value::response(
                    -1,
                    "expected [caller_id, topic, protocols]",
                    Value::Int(0),
                )
            }
        };
        if self.lookup_publication(topic).is_none() {
            return Value::response(
                0,
                format!("not a publisher of [{}]", topic),
                Value::Int(0),
            );
        }
        let tcpros = protocols.iter().any(|p| {
            matches!(p.as_array(), Some([Value::String(name), ..]) if name == "TCPROS")
        });
        if !tcpros {
            log::debug!(
                "[topics] {} requested {} with no supported protocol",
                caller,
                topic
            );
            return Value::response(0, "no supported protocol implementations", Value::Array(vec![]));
        }
        let port = i32::from(self.connections.tcpros_port());
        success(
            "",
            Value::Array(vec![
                Value::from("TCPROS"),
                Value::from(self.connections.advertise_host()),
                Value::Int(port),
            ]),
        )
    }

    /// `[publish_stats, subscribe_stats]` halves of `getBusStats`.
    pub fn bus_stats(&self) -> (Value, Value) {
        let (pubs, subs) = self.snapshot();
        let publish = pubs
            .iter()
            .map(|p| {
                let links = p.link_stats();
                let total: u64 = links.iter().map(|l| l.bytes_sent).sum();
                Value::Array(vec![
                    Value::from(p.name()),
                    int(total),
                    Value::Array(
                        links
                            .iter()
                            .map(|l| {
                                Value::Array(vec![
                                    int(l.id),
                                    int(l.bytes_sent),
                                    int(l.messages_sent),
                                    Value::Bool(l.connected),
                                ])
                            })
                            .collect(),
                    ),
                ])
            })
            .collect();
        let subscribe = subs
            .iter()
            .map(|s| {
                Value::Array(vec![
                    Value::from(s.name()),
                    Value::Array(
                        s.link_stats()
                            .iter()
                            .map(|l| {
                                Value::Array(vec![
                                    int(l.id),
                                    int(l.bytes_received),
                                    Value::Int(-1),
                                    Value::Bool(l.connected),
                                ])
                            })
                            .collect(),
                    ),
                ])
            })
            .collect();
        (Value::Array(publish), Value::Array(subscribe))
    }

    /// `getBusInfo` rows: `[id, destination, direction, transport, topic,
    /// connected, info]`.
    pub fn bus_info(&self) -> Vec<Value> {
        let (pubs, subs) = self.snapshot();
        let mut rows = Vec::new();
        for p in &pubs {
            for l in p.link_info() {
                rows.push(Value::Array(vec![
                    int(l.id),
                    Value::from(l.destination.as_str()),
                    Value::from("o"),
                    Value::from(l.transport),
                    Value::from(p.name()),
                    Value::Bool(true),
                    Value::from(l.info.as_str()),
                ]));
            }
        }
        for s in &subs {
            for l in s.link_info() {
                rows.push(Value::Array(vec![
                    int(l.id),
                    Value::from(l.publisher_uri.as_str()),
                    Value::from("i"),
                    Value::from(l.transport),
                    Value::from(s.name()),
                    Value::Bool(true),
                    Value::from(l.info.as_str()),
                ]));
            }
        }
        rows
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drop every publication and subscription and unregister them.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for method in ["publisherUpdate", "requestTopic", "getPublications", "getSubscriptions"] {
            self.xmlrpc.unbind(method);
        }
        let (pubs, subs) = {
            let mut registry = self.registry.lock();
            (
                std::mem::take(&mut registry.publications),
                std::mem::take(&mut registry.subscriptions),
            )
        };
        for (topic, advertised) in pubs {
            advertised.publication.drop_publication();
            if let Err(e) = self.master.unregister_publisher(&topic) {
                log::debug!("[topics] unregisterPublisher {} failed: {}", topic, e);
            }
        }
        for (topic, sub) in subs {
            sub.shutdown();
            if let Err(e) = self.master.unregister_subscriber(&topic) {
                log::debug!("[topics] unregisterSubscriber {} failed: {}", topic, e);
            }
        }
        log::debug!("[topics] shut down");
    }
}

impl std::fmt::Debug for TopicManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("TopicManager")
            .field("node", &self.node_name)
            .field("publications", &registry.publications.len())
            .field("subscriptions", &registry.subscriptions.len())
            .finish()
    }
}


fn int(v: u64) -> Value {
    Value::Int(i32::try_from(v).unwrap_or(i32::MAX))
}

fn pairs_value(pairs: Vec<(String, String)>) -> Value {
    Value::Array(
        pairs
            .into_iter()
            .map(|(a, b)| Value::Array(vec![Value::String(a), Value::String(b)]))
            .collect(),
    )
}
