// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node runtime.
//!
//! A [`Node`] owns every manager of one ROS node and wires them together:
//!
//! ```text
//!                +-------------------- Node --------------------+
//!                |                                              |
//!  XML-RPC  <--> | XmlRpcManager --- Master --- Param           |
//!                |       |             |                        |
//!                |  TopicManager  ServiceManager  CallbackQueue |
//!                |       \            /                 |       |
//!  TCPROS   <--> |      ConnectionManager        spin / spinner |
//!                +----------------------------------------------+
//! ```
//!
//! Nothing is global: two nodes in one process are fully independent.
//! Handles returned by `advertise`, `subscribe` and `advertise_service`
//! release their registration when the last clone is dropped.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::callback_queue::{next_owner_id, AsyncSpinner, CallbackQueue, MessageFn, OwnerId};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::master::Master;
use crate::message::{MessageEvent, RosMessage, RosService};
use crate::names;
use crate::param::Param;
use crate::service::{
    wait_for_service, AdvertiseServiceOptions, RawServiceClient, ServiceClient, ServiceHandler,
    ServiceManager, ServicePublication,
};
use crate::topic::{
    AdvertiseOptions, Publication, SubscribeOptions, SubscriberStatusCallbacks, Subscription,
    TopicManager,
};
use crate::transport::ConnectionManager;
use crate::xmlrpc::Value;
use crate::xmlrpc_manager::{success, XmlRpcManager};

/// Poll period of [`Node::spin`].
const SPIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Settings of one subscriber, see [`Node::subscribe_with_options`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Messages kept per callback before the oldest is dropped.
    pub queue_size: usize,
    /// Ask publishers to disable Nagle on the link.
    pub tcp_nodelay: bool,
    /// Let several spinner threads run the callback at once.
    pub allow_concurrent_callbacks: bool,
}

impl SubscriberOptions {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size,
            tcp_nodelay: false,
            allow_concurrent_callbacks: false,
        }
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_concurrent_callbacks(mut self, allow: bool) -> Self {
        self.allow_concurrent_callbacks = allow;
        self
    }
}

/// Wrap a typed callback into a payload-decoding delivery function.
fn typed_delivery<M, F>(topic: &str, callback: F) -> MessageFn
where
    M: RosMessage,
    F: Fn(Arc<M>, &str) + Send + Sync + 'static,
{
    let label = topic.to_string();
    Arc::new(move |event: MessageEvent| match event.payload.downcast::<M>() {
        Ok(msg) => callback(msg, &*event.publisher),
        Err(e) => log::warn!(
            "[sub {}] dropping message from {}: {}",
            label,
            event.publisher,
            e
        ),
    })
}

pub struct Node {
    name: String,
    namespace: String,
    config: NodeConfig,
    xmlrpc: Arc<XmlRpcManager>,
    master: Arc<Master>,
    connections: Arc<ConnectionManager>,
    topics: Arc<TopicManager>,
    services: Arc<ServiceManager>,
    param: Arc<Param>,
    queue: Arc<CallbackQueue>,
    shutdown: AtomicBool,
}

impl Node {
    /// Start the XML-RPC and TCPROS servers and bind the slave API.
    ///
    /// `name` is resolved against `config.namespace`; it may not be private.
    pub fn new(name: &str, config: NodeConfig) -> Result<Arc<Node>> {
        config.validate()?;
        if name.starts_with('~') {
            return Err(Error::InvalidName(name.to_string()));
        }
        let name = names::resolve(&config.namespace, "/", name)?;
        let namespace = names::parent_namespace(&name);

        let xmlrpc = XmlRpcManager::start(&config)?;
        let master = Arc::new(Master::new(&config, &name, xmlrpc.clone()));
        let connections = match ConnectionManager::start(&config) {
            Ok(c) => c,
            Err(e) => {
                xmlrpc.shutdown();
                return Err(e);
            }
        };
        let queue = Arc::new(CallbackQueue::new());
        let topics = TopicManager::new(
            &name,
            xmlrpc.clone(),
            master.clone(),
            connections.clone(),
            queue.clone(),
        );
        let services = ServiceManager::new(&name, master.clone(), connections.clone());
        connections.set_routes(Arc::downgrade(&topics), Arc::downgrade(&services));
        let param = Param::new(master.clone(), xmlrpc.clone(), &namespace, &name);

        let node = Arc::new(Node {
            name,
            namespace,
            config,
            xmlrpc,
            master,
            connections,
            topics,
            services,
            param,
            queue,
            shutdown: AtomicBool::new(false),
        });
        node.topics.bind_handlers();
        node.param.bind_handlers();
        node.bind_handlers();
        log::info!(
            "[node] {} started (xmlrpc {}, tcpros port {})",
            node.name,
            node.xmlrpc.uri(),
            node.connections.tcpros_port()
        );
        Ok(node)
    }

    fn bind_handlers(self: &Arc<Self>) {
        self.xmlrpc.bind_fn("getPid", |_| {
            success("", Value::Int(std::process::id() as i32))
        });

        let master_uri = self.master.uri().to_string();
        self.xmlrpc.bind_fn("getMasterUri", move |_| {
            success("", Value::from(master_uri.as_str()))
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("shutdown", move |params| {
            let reason = params
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            request_shutdown(weak.clone(), reason);
            success("shutdown", Value::Int(0))
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("getBusStats", move |_| match weak.upgrade() {
            Some(node) => success("", node.bus_stats()),
            None => Value::response(0, "node is shutting down", Value::Int(0)),
        });

        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("getBusInfo", move |_| match weak.upgrade() {
            Some(node) => success("", Value::Array(node.topics.bus_info())),
            None => Value::response(0, "node is shutting down", Value::Int(0)),
        });
    }

    fn bus_stats(&self) -> Value {
        let (publish, subscribe) = self.topics.bus_stats();
        let srv = self.services.bus_stats();
        let int = |v: u64| Value::Int(i32::try_from(v).unwrap_or(i32::MAX));
        Value::Array(vec![
            publish,
            subscribe,
            Value::Array(vec![
                int(srv.requests),
                int(srv.bytes_received),
                int(srv.bytes_sent),
            ]),
        ])
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Fully resolved node name (`/ns/name`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// XML-RPC URI of this node.
    pub fn uri(&self) -> &str {
        self.xmlrpc.uri()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn param(&self) -> &Arc<Param> {
        &self.param
    }

    /// The global queue every callback of this node goes through.
    pub fn callback_queue(&self) -> &Arc<CallbackQueue> {
        &self.queue
    }

    pub fn topic_manager(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Resolve `name` against this node's namespace and name.
    pub fn resolve_name(&self, name: &str) -> Result<String> {
        names::resolve(&self.namespace, &self.name, name)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Topics
    // ========================================================================

    pub fn advertise<M: RosMessage>(&self, topic: &str, queue_size: usize, latch: bool) -> Result<Publisher<M>> {
        self.advertise_with_callbacks(topic, queue_size, latch, SubscriberStatusCallbacks::default())
    }

    /// Advertise with subscriber connect / disconnect callbacks.
    pub fn advertise_with_callbacks<M: RosMessage>(
        &self,
        topic: &str,
        queue_size: usize,
        latch: bool,
        callbacks: SubscriberStatusCallbacks,
    ) -> Result<Publisher<M>> {
        self.check_running()?;
        let topic = self.resolve_name(topic)?;
        let owner = next_owner_id();
        let publication = self.topics.advertise(
            AdvertiseOptions {
                topic: topic.clone(),
                datatype: M::msg_type(),
                md5sum: M::md5sum(),
                message_definition: M::msg_definition(),
                queue_size,
                latch,
                has_header: M::has_header(),
                callbacks,
            },
            owner,
        )?;
        Ok(Publisher {
            inner: Arc::new(PublisherHandle {
                topic,
                owner,
                publication,
                topics: Arc::downgrade(&self.topics),
            }),
            _msg: PhantomData,
        })
    }

    /// Subscribe with a typed callback.
    pub fn subscribe<M, F>(&self, topic: &str, queue_size: usize, callback: F) -> Result<Subscriber>
    where
        M: RosMessage,
        F: Fn(Arc<M>) + Send + Sync + 'static,
    {
        self.subscribe_with_publisher::<M, _>(topic, queue_size, move |msg, _| callback(msg))
    }

    /// Like [`subscribe`](Self::subscribe), also passing the publisher's
    /// caller id.
    pub fn subscribe_with_publisher<M, F>(&self, topic: &str, queue_size: usize, callback: F) -> Result<Subscriber>
    where
        M: RosMessage,
        F: Fn(Arc<M>, &str) + Send + Sync + 'static,
    {
        let resolved = self.resolve_name(topic)?;
        let deliver = typed_delivery::<M, _>(&resolved, callback);
        self.subscribe_raw(
            &resolved,
            &M::msg_type(),
            &M::md5sum(),
            SubscriberOptions::new(queue_size),
            deliver,
        )
    }

    /// Subscribe with explicit transport and dispatch settings.
    ///
    /// With [`SubscriberOptions::with_concurrent_callbacks`], messages of
    /// this subscription may be delivered on several spinner threads at
    /// once.
    pub fn subscribe_with_options<M, F>(
        &self,
        topic: &str,
        options: SubscriberOptions,
        callback: F,
    ) -> Result<Subscriber>
    where
        M: RosMessage,
        F: Fn(Arc<M>) + Send + Sync + 'static,
    {
        let resolved = self.resolve_name(topic)?;
        let deliver = typed_delivery::<M, _>(&resolved, move |msg, _| callback(msg));
        self.subscribe_raw(&resolved, &M::msg_type(), &M::md5sum(), options, deliver)
    }

    /// Subscribe without knowing the type: the md5sum and type stay wildcard
    /// until pinned by the first publisher.
    pub fn subscribe_any<F>(&self, topic: &str, queue_size: usize, callback: F) -> Result<Subscriber>
    where
        F: Fn(MessageEvent) + Send + Sync + 'static,
    {
        let resolved = self.resolve_name(topic)?;
        self.subscribe_raw(
            &resolved,
            crate::topic::WILDCARD,
            crate::topic::WILDCARD,
            SubscriberOptions::new(queue_size),
            Arc::new(callback),
        )
    }

    fn subscribe_raw(
        &self,
        topic: &str,
        datatype: &str,
        md5sum: &str,
        options: SubscriberOptions,
        deliver: MessageFn,
    ) -> Result<Subscriber> {
        self.check_running()?;
        let owner = next_owner_id();
        let subscription = self.topics.subscribe(
            SubscribeOptions {
                topic: topic.to_string(),
                datatype: datatype.to_string(),
                md5sum: md5sum.to_string(),
                queue_size: options.queue_size,
                tcp_nodelay: options.tcp_nodelay,
                allow_concurrent: options.allow_concurrent_callbacks,
                queue: self.queue.clone(),
                deliver,
            },
            owner,
        )?;
        Ok(Subscriber {
            inner: Arc::new(SubscriberHandle {
                topic: topic.to_string(),
                owner,
                subscription,
                topics: Arc::downgrade(&self.topics),
            }),
        })
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Advertise a service. The handler runs on the node's callback queue;
    /// an `Err` is sent back to the caller as a failed call.
    pub fn advertise_service<S, F>(&self, service: &str, handler: F) -> Result<ServiceServer>
    where
        S: RosService,
        F: Fn(S::Request) -> std::result::Result<S::Response, String> + Send + Sync + 'static,
    {
        self.check_running()?;
        let service = self.resolve_name(service)?;
        let raw: ServiceHandler = Arc::new(move |bytes: &[u8]| {
            let request = S::Request::from_bytes(bytes).map_err(|e| e.to_string())?;
            handler(request).map(|response| response.to_bytes())
        });
        let service_type = S::service_type();
        let owner = next_owner_id();
        let publication = self.services.advertise_service(
            AdvertiseServiceOptions {
                service: service.clone(),
                md5sum: S::md5sum(),
                datatype: service_type.clone(),
                request_type: format!("{}Request", service_type),
                response_type: format!("{}Response", service_type),
                handler: raw,
                queue: self.queue.clone(),
            },
            owner,
        )?;
        Ok(ServiceServer {
            inner: Arc::new(ServiceServerHandle {
                service,
                publication,
                services: Arc::downgrade(&self.services),
            }),
        })
    }

    pub fn service_client<S: RosService>(&self, service: &str, persistent: bool) -> Result<ServiceClient<S>> {
        self.check_running()?;
        let service = self.resolve_name(service)?;
        Ok(ServiceClient::new(Arc::new(RawServiceClient::new(
            &service,
            &S::md5sum(),
            &self.name,
            persistent,
            self.master.clone(),
            self.connections.clone(),
        ))))
    }

    /// Block until `service` is available. `None` waits forever.
    pub fn wait_for_service(&self, service: &str, timeout: Option<Duration>) -> Result<()> {
        let service = self.resolve_name(service)?;
        wait_for_service(&self.master, &self.connections, &self.name, &service, timeout)
    }

    // ========================================================================
    // Spinning
    // ========================================================================

    /// Run every callback queued right now.
    pub fn spin_once(&self) -> usize {
        self.queue.call_available(Duration::ZERO)
    }

    /// Run callbacks until the node shuts down.
    pub fn spin(&self) {
        while !self.is_shutdown() {
            self.queue.call_available(SPIN_TIMEOUT);
        }
    }

    /// Background threads draining the node's queue; call `start()` on it.
    pub fn async_spinner(&self, threads: usize) -> AsyncSpinner {
        AsyncSpinner::new(self.queue.clone(), threads)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Unregister everything, close every connection and stop the servers.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[node] {} shutting down", self.name);
        self.master.disable_retries();
        self.topics.shutdown();
        self.services.shutdown();
        self.param.unsubscribe_all();
        self.queue.disable();
        self.queue.clear();
        self.connections.shutdown();
        self.xmlrpc.shutdown();
    }
}

/// Remote `shutdown` request: run it off the XML-RPC handler thread.
fn request_shutdown(node: Weak<Node>, reason: String) {
    let spawned = thread::Builder::new()
        .name("rosnode-shutdown".into())
        .spawn(move || {
            if let Some(node) = node.upgrade() {
                log::warn!("[node] shutdown requested remotely: {}", reason);
                node.shutdown();
            }
        });
    if let Err(e) = spawned {
        log::error!("[node] cannot spawn shutdown thread: {}", e);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("uri", &self.xmlrpc.uri())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ============================================================================
// Handles
// ============================================================================

struct PublisherHandle {
    topic: String,
    owner: OwnerId,
    publication: Arc<Publication>,
    topics: Weak<TopicManager>,
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        if let Some(topics) = self.topics.upgrade() {
            if let Err(e) = topics.unadvertise(&self.topic, self.owner) {
                log::debug!("[node] unadvertise {} failed: {}", self.topic, e);
            }
        }
    }
}

/// Typed publishing handle. Clones share one registration.
pub struct Publisher<M: RosMessage> {
    inner: Arc<PublisherHandle>,
    _msg: PhantomData<fn(M)>,
}

impl<M: RosMessage> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _msg: PhantomData,
        }
    }
}

impl<M: RosMessage> Publisher<M> {
    pub fn publish(&self, msg: M) -> Result<()> {
        self.inner.publication.publish(msg)
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn num_subscribers(&self) -> usize {
        self.inner.publication.num_subscribers()
    }

    /// Caller ids of connected subscribers.
    pub fn subscriber_names(&self) -> Vec<String> {
        self.inner.publication.subscriber_names()
    }

    pub fn is_latched(&self) -> bool {
        self.inner.publication.is_latching()
    }
}

impl<M: RosMessage> std::fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.inner.topic)
            .field("type", &M::msg_type())
            .finish()
    }
}

struct SubscriberHandle {
    topic: String,
    owner: OwnerId,
    subscription: Arc<Subscription>,
    topics: Weak<TopicManager>,
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if let Some(topics) = self.topics.upgrade() {
            if let Err(e) = topics.unsubscribe(&self.topic, self.owner) {
                log::debug!("[node] unsubscribe {} failed: {}", self.topic, e);
            }
        }
    }
}

/// Subscription handle. Clones share one callback registration.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberHandle>,
}

impl Subscriber {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn num_publishers(&self) -> usize {
        self.inner.subscription.num_publishers()
    }

    /// Caller ids of connected publishers.
    pub fn publisher_names(&self) -> Vec<String> {
        self.inner.subscription.publisher_names()
    }

    /// Messages evicted from full callback queues.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.subscription.dropped_messages()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.inner.topic)
            .finish()
    }
}

struct ServiceServerHandle {
    service: String,
    publication: Arc<ServicePublication>,
    services: Weak<ServiceManager>,
}

impl Drop for ServiceServerHandle {
    fn drop(&mut self) {
        if let Some(services) = self.services.upgrade() {
            if let Err(e) = services.unadvertise_service(&self.service) {
                log::debug!("[node] unadvertise service {} failed: {}", self.service, e);
            }
        }
    }
}

/// Advertised service handle. Clones share one registration.
#[derive(Clone)]
pub struct ServiceServer {
    inner: Arc<ServiceServerHandle>,
}

impl ServiceServer {
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn requests_handled(&self) -> u64 {
        self.inner.publication.stats().requests
    }
}

impl std::fmt::Debug for ServiceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceServer")
            .field("service", &self.inner.service)
            .finish()
    }
}
