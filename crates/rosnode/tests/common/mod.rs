// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process ROS master for integration tests.
//!
//! Implements the registration, lookup and parameter calls the node makes,
//! and pushes `publisherUpdate` to subscribers the way `rosmaster` does.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rosnode::xmlrpc::{parse_http_uri, HandlerTable, Value, XmlRpcClient, XmlRpcServer};
use rosnode::NodeConfig;

#[derive(Default)]
struct Registry {
    /// topic -> [(caller_id, api uri)]
    publishers: HashMap<String, Vec<(String, String)>>,
    subscribers: HashMap<String, Vec<(String, String)>>,
    /// service -> (caller_id, rosrpc uri)
    services: HashMap<String, (String, String)>,
    topic_types: HashMap<String, String>,
    nodes: HashMap<String, String>,
    params: BTreeMap<String, Value>,
    /// key -> [api uri]
    param_subscribers: HashMap<String, Vec<String>>,
}

pub struct FakeMaster {
    server: XmlRpcServer,
    handlers: HandlerTable,
    uri: String,
    registry: Arc<Mutex<Registry>>,
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
}

pub fn ok(payload: Value) -> Value {
    Value::response(1, "", payload)
}

pub fn err(message: &str) -> Value {
    Value::response(-1, message, Value::Int(0))
}

fn string_at(params: &[Value], i: usize) -> String {
    params
        .get(i)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn push_unique(list: &mut Vec<(String, String)>, caller: String, uri: String) {
    list.retain(|(c, _)| *c != caller);
    list.push((caller, uri));
}

/// Fire-and-forget XML-RPC call to a node.
fn notify(uri: String, method: &'static str, params: Vec<Value>) {
    thread::spawn(move || {
        if let Ok((host, port)) = parse_http_uri(&uri) {
            let client = XmlRpcClient::new(host, port, Duration::from_secs(1), Duration::from_secs(2));
            let _ = client.call(method, &params);
        }
    });
}

impl FakeMaster {
    pub fn start() -> Self {
        let handlers: HandlerTable = Arc::new(DashMap::new());
        let server = XmlRpcServer::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            handlers.clone(),
        )
        .unwrap();
        let uri = format!("http://127.0.0.1:{}/", server.port());
        let master = Self {
            server,
            handlers: handlers.clone(),
            uri,
            registry: Arc::new(Mutex::new(Registry::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        master.install(&handlers);
        master
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Loopback node configuration pointing at this master.
    pub fn config(&self) -> NodeConfig {
        NodeConfig::loopback(self.uri.clone()).with_master_retry_timeout(Duration::from_secs(2))
    }

    /// Every call received so far: (method, params).
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn publishers_of(&self, topic: &str) -> Vec<String> {
        self.registry
            .lock()
            .publishers
            .get(topic)
            .map(|l| l.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.registry.lock().services.contains_key(service)
    }

    /// Register a publisher the way a remote node would, without a node.
    pub fn add_publisher(&self, caller: &str, topic: &str, datatype: &str, api: &str) {
        let params = [
            Value::from(caller),
            Value::from(topic),
            Value::from(datatype),
            Value::from(api),
        ];
        register_publisher(&self.registry, &params);
    }

    /// Replace the handler of `method`. Calls are still recorded.
    pub fn override_method<F>(&self, method: &'static str, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let calls = self.calls.clone();
        self.handlers.insert(
            method.to_string(),
            Arc::new(move |params: &[Value]| {
                calls.lock().push((method.to_string(), params.to_vec()));
                f(params)
            }),
        );
    }

    fn install(&self, handlers: &HandlerTable) {
        let bind = |method: &'static str, f: fn(&Mutex<Registry>, &[Value]) -> Value| {
            let registry = self.registry.clone();
            let calls = self.calls.clone();
            handlers.insert(
                method.to_string(),
                Arc::new(move |params: &[Value]| {
                    calls.lock().push((method.to_string(), params.to_vec()));
                    f(&registry, params)
                }),
            );
        };

        bind("getUri", |_, _| ok(Value::from("http://127.0.0.1:11311/")));
        bind("registerPublisher", register_publisher);
        bind("unregisterPublisher", unregister_publisher);
        bind("registerSubscriber", register_subscriber);
        bind("unregisterSubscriber", unregister_subscriber);
        bind("registerService", register_service);
        bind("unregisterService", unregister_service);
        bind("lookupService", lookup_service);
        bind("lookupNode", lookup_node);
        bind("getPublishedTopics", get_published_topics);
        bind("getTopicTypes", get_topic_types);
        bind("getSystemState", get_system_state);
        bind("getParam", get_param);
        bind("setParam", set_param);
        bind("deleteParam", delete_param);
        bind("hasParam", has_param);
        bind("getParamNames", get_param_names);
        bind("searchParam", |_, _| err("not implemented"));
        bind("subscribeParam", subscribe_param);
        bind("unsubscribeParam", unsubscribe_param);
    }
}

impl Drop for FakeMaster {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn publisher_uris(reg: &Registry, topic: &str) -> Vec<Value> {
    reg.publishers
        .get(topic)
        .map(|l| l.iter().map(|(_, uri)| Value::from(uri.as_str())).collect())
        .unwrap_or_default()
}

fn push_publisher_update(reg: &Registry, topic: &str) {
    let pubs = publisher_uris(reg, topic);
    for (_, uri) in reg.subscribers.get(topic).cloned().unwrap_or_default() {
        notify(
            uri,
            "publisherUpdate",
            vec![Value::from("/master"), Value::from(topic), Value::Array(pubs.clone())],
        );
    }
}

fn register_publisher(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (caller, topic, datatype, uri) = (
        string_at(params, 0),
        string_at(params, 1),
        string_at(params, 2),
        string_at(params, 3),
    );
    let mut reg = registry.lock();
    reg.nodes.insert(caller.clone(), uri.clone());
    reg.topic_types.entry(topic.clone()).or_insert(datatype);
    push_unique(reg.publishers.entry(topic.clone()).or_default(), caller, uri);
    push_publisher_update(&reg, &topic);
    let subs = reg
        .subscribers
        .get(&topic)
        .map(|l| l.iter().map(|(_, u)| Value::from(u.as_str())).collect())
        .unwrap_or_default();
    ok(Value::Array(subs))
}

fn unregister_publisher(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (caller, topic) = (string_at(params, 0), string_at(params, 1));
    let mut reg = registry.lock();
    let removed = match reg.publishers.get_mut(&topic) {
        Some(list) => {
            let before = list.len();
            list.retain(|(c, _)| *c != caller);
            before - list.len()
        }
        None => 0,
    };
    if removed > 0 {
        push_publisher_update(&reg, &topic);
    }
    ok(Value::Int(removed as i32))
}

fn register_subscriber(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (caller, topic, datatype, uri) = (
        string_at(params, 0),
        string_at(params, 1),
        string_at(params, 2),
        string_at(params, 3),
    );
    let mut reg = registry.lock();
    reg.nodes.insert(caller.clone(), uri.clone());
    if datatype != "*" {
        reg.topic_types.entry(topic.clone()).or_insert(datatype);
    }
    push_unique(reg.subscribers.entry(topic.clone()).or_default(), caller, uri);
    ok(Value::Array(publisher_uris(&reg, &topic)))
}

fn unregister_subscriber(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (caller, topic) = (string_at(params, 0), string_at(params, 1));
    let mut reg = registry.lock();
    let removed = match reg.subscribers.get_mut(&topic) {
        Some(list) => {
            let before = list.len();
            list.retain(|(c, _)| *c != caller);
            before - list.len()
        }
        None => 0,
    };
    ok(Value::Int(removed as i32))
}

fn register_service(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (caller, service, service_uri, api) = (
        string_at(params, 0),
        string_at(params, 1),
        string_at(params, 2),
        string_at(params, 3),
    );
    let mut reg = registry.lock();
    reg.nodes.insert(caller.clone(), api);
    reg.services.insert(service, (caller, service_uri));
    ok(Value::Int(1))
}

fn unregister_service(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (service, service_uri) = (string_at(params, 1), string_at(params, 2));
    let mut reg = registry.lock();
    let matches = matches!(reg.services.get(&service), Some((_, uri)) if *uri == service_uri);
    if matches {
        reg.services.remove(&service);
    }
    ok(Value::Int(i32::from(matches)))
}

fn lookup_service(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let service = string_at(params, 1);
    match registry.lock().services.get(&service) {
        Some((_, uri)) => ok(Value::from(uri.as_str())),
        None => err("no provider"),
    }
}

fn lookup_node(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let node = string_at(params, 1);
    match registry.lock().nodes.get(&node) {
        Some(uri) => ok(Value::from(uri.as_str())),
        None => err("unknown node"),
    }
}

fn get_published_topics(registry: &Mutex<Registry>, _: &[Value]) -> Value {
    let reg = registry.lock();
    let list = reg
        .publishers
        .iter()
        .filter(|(_, l)| !l.is_empty())
        .map(|(topic, _)| {
            let ty = reg.topic_types.get(topic).cloned().unwrap_or_default();
            Value::Array(vec![Value::from(topic.as_str()), Value::from(ty)])
        })
        .collect();
    ok(Value::Array(list))
}

fn get_topic_types(registry: &Mutex<Registry>, _: &[Value]) -> Value {
    let reg = registry.lock();
    let list = reg
        .topic_types
        .iter()
        .map(|(t, ty)| Value::Array(vec![Value::from(t.as_str()), Value::from(ty.as_str())]))
        .collect();
    ok(Value::Array(list))
}

fn get_system_state(registry: &Mutex<Registry>, _: &[Value]) -> Value {
    let reg = registry.lock();
    let section = |map: &HashMap<String, Vec<(String, String)>>| {
        Value::Array(
            map.iter()
                .filter(|(_, l)| !l.is_empty())
                .map(|(name, l)| {
                    Value::Array(vec![
                        Value::from(name.as_str()),
                        Value::Array(l.iter().map(|(c, _)| Value::from(c.as_str())).collect()),
                    ])
                })
                .collect(),
        )
    };
    let services = Value::Array(
        reg.services
            .iter()
            .map(|(name, (caller, _))| {
                Value::Array(vec![
                    Value::from(name.as_str()),
                    Value::Array(vec![Value::from(caller.as_str())]),
                ])
            })
            .collect(),
    );
    ok(Value::Array(vec![
        section(&reg.publishers),
        section(&reg.subscribers),
        services,
    ]))
}

fn get_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let key = string_at(params, 1);
    match registry.lock().params.get(&key) {
        Some(v) => ok(v.clone()),
        None => err("parameter is not set"),
    }
}

fn set_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let key = string_at(params, 1);
    let value = params.get(2).cloned().unwrap_or(Value::Int(0));
    let mut reg = registry.lock();
    reg.params.insert(key.clone(), value.clone());
    for uri in reg.param_subscribers.get(&key).cloned().unwrap_or_default() {
        notify(
            uri,
            "paramUpdate",
            vec![Value::from("/master"), Value::from(key.as_str()), value.clone()],
        );
    }
    ok(Value::Int(0))
}

fn delete_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let key = string_at(params, 1);
    match registry.lock().params.remove(&key) {
        Some(_) => ok(Value::Int(0)),
        None => err("parameter is not set"),
    }
}

fn has_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let key = string_at(params, 1);
    ok(Value::Bool(registry.lock().params.contains_key(&key)))
}

fn get_param_names(registry: &Mutex<Registry>, _: &[Value]) -> Value {
    let names = registry
        .lock()
        .params
        .keys()
        .map(|k| Value::from(k.as_str()))
        .collect();
    ok(Value::Array(names))
}

fn subscribe_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (uri, key) = (string_at(params, 1), string_at(params, 2));
    let mut reg = registry.lock();
    reg.param_subscribers.entry(key.clone()).or_default().push(uri);
    ok(reg
        .params
        .get(&key)
        .cloned()
        .unwrap_or(Value::Struct(BTreeMap::new())))
}

fn unsubscribe_param(registry: &Mutex<Registry>, params: &[Value]) -> Value {
    let (uri, key) = (string_at(params, 1), string_at(params, 2));
    let mut reg = registry.lock();
    if let Some(list) = reg.param_subscribers.get_mut(&key) {
        list.retain(|u| *u != uri);
    }
    ok(Value::Int(1))
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
