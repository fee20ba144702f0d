// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master API client.
//!
//! Connection failures are retried every `master_retry_interval` until
//! `master_retry_timeout` has elapsed. A response with a status other than 1
//! is an application failure: it is returned at once, never retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::xmlrpc::{parse_rosrpc_uri, Value};
use crate::xmlrpc_manager::{validate_response, XmlRpcManager};

/// `[publishers, subscribers, services]`, each a list of `(name, nodes)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemState {
    pub publishers: Vec<(String, Vec<String>)>,
    pub subscribers: Vec<(String, Vec<String>)>,
    pub services: Vec<(String, Vec<String>)>,
}

pub struct Master {
    uri: String,
    caller_id: String,
    caller_api: String,
    xmlrpc: Arc<XmlRpcManager>,
    retry_timeout: Duration,
    retry_interval: Duration,
    /// Set during node shutdown: one attempt per call, no retries.
    no_retry: AtomicBool,
}

impl Master {
    pub fn new(config: &NodeConfig, caller_id: &str, xmlrpc: Arc<XmlRpcManager>) -> Self {
        Self {
            uri: config.master_uri.clone(),
            caller_id: caller_id.to_string(),
            caller_api: xmlrpc.uri().to_string(),
            xmlrpc,
            retry_timeout: config.master_retry_timeout,
            retry_interval: config.master_retry_interval,
            no_retry: AtomicBool::new(false),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Stop retrying unreachable-master failures (used while shutting down).
    pub fn disable_retries(&self) {
        self.no_retry.store(true, Ordering::Release);
    }

    /// Call `method(args)` on the master and return the validated payload.
    pub fn execute(&self, method: &str, args: &[Value]) -> Result<Value> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            match self.xmlrpc.call(&self.uri, method, args) {
                Ok(response) => {
                    if warned {
                        log::info!("[master] connected to {}", self.uri);
                    }
                    return validate_response(method, response).map_err(|e| {
                        if let Error::RpcFailed { code, message, .. } = &e {
                            log::warn!(
                                "[master] {} failed with code {}: {}",
                                method,
                                code,
                                message
                            );
                        }
                        e
                    });
                }
                Err(Error::XmlRpc(e)) if e.is_transport() => {
                    if self.no_retry.load(Ordering::Acquire) || start.elapsed() >= self.retry_timeout {
                        log::error!(
                            "[master] giving up on {} after {:?}: {}",
                            method,
                            self.retry_timeout,
                            e
                        );
                        return Err(Error::MasterUnreachable {
                            method: method.to_string(),
                            uri: self.uri.clone(),
                        });
                    }
                    if !warned {
                        log::warn!(
                            "[master] {} unreachable ({}), retrying every {:?}",
                            self.uri,
                            e,
                            self.retry_interval
                        );
                        warned = true;
                    }
                    thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn caller(&self) -> Value {
        Value::from(self.caller_id.as_str())
    }

    fn string_list(method: &str, payload: Value) -> Result<Vec<String>> {
        payload.as_string_list().ok_or_else(|| Error::InvalidResponse {
            method: method.to_string(),
            reason: "payload is not a list of strings".into(),
        })
    }

    fn string(method: &str, payload: Value) -> Result<String> {
        match payload {
            Value::String(s) => Ok(s),
            _ => Err(Error::InvalidResponse {
                method: method.to_string(),
                reason: "payload is not a string".into(),
            }),
        }
    }

    fn pairs(method: &str, payload: &Value) -> Result<Vec<(String, String)>> {
        let invalid = || Error::InvalidResponse {
            method: method.to_string(),
            reason: "payload is not a list of [name, type] pairs".into(),
        };
        payload
            .as_array()
            .ok_or_else(invalid)?
            .iter()
            .map(|pair| match pair.as_array() {
                Some([Value::String(a), Value::String(b)]) => Ok((a.clone(), b.clone())),
                _ => Err(invalid()),
            })
            .collect()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Returns the URIs of current subscribers.
    pub fn register_publisher(&self, topic: &str, datatype: &str) -> Result<Vec<String>> {
        let payload = self.execute(
            "registerPublisher",
            &[
                self.caller(),
                Value::from(topic),
                Value::from(datatype),
                Value::from(self.caller_api.as_str()),
            ],
        )?;
        Self::string_list("registerPublisher", payload)
    }

    pub fn unregister_publisher(&self, topic: &str) -> Result<()> {
        self.execute(
            "unregisterPublisher",
            &[
                self.caller(),
                Value::from(topic),
                Value::from(self.caller_api.as_str()),
            ],
        )
        .map(|_| ())
    }

    /// Returns the URIs of current publishers.
    pub fn register_subscriber(&self, topic: &str, datatype: &str) -> Result<Vec<String>> {
        let payload = self.execute(
            "registerSubscriber",
            &[
                self.caller(),
                Value::from(topic),
                Value::from(datatype),
                Value::from(self.caller_api.as_str()),
            ],
        )?;
        Self::string_list("registerSubscriber", payload)
    }

    pub fn unregister_subscriber(&self, topic: &str) -> Result<()> {
        self.execute(
            "unregisterSubscriber",
            &[
                self.caller(),
                Value::from(topic),
                Value::from(self.caller_api.as_str()),
            ],
        )
        .map(|_| ())
    }

    pub fn register_service(&self, service: &str, service_uri: &str) -> Result<()> {
        self.execute(
            "registerService",
            &[
                self.caller(),
                Value::from(service),
                Value::from(service_uri),
                Value::from(self.caller_api.as_str()),
            ],
        )
        .map(|_| ())
    }

    pub fn unregister_service(&self, service: &str, service_uri: &str) -> Result<()> {
        self.execute(
            "unregisterService",
            &[self.caller(), Value::from(service), Value::from(service_uri)],
        )
        .map(|_| ())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolve a service to its TCPROS endpoint.
    pub fn lookup_service(&self, service: &str) -> Result<(String, u16)> {
        let payload = match self.execute("lookupService", &[self.caller(), Value::from(service)]) {
            Ok(p) => p,
            Err(Error::RpcFailed { .. }) => return Err(Error::ServiceNotFound(service.to_string())),
            Err(e) => return Err(e),
        };
        parse_rosrpc_uri(&Self::string("lookupService", payload)?)
    }

    /// XML-RPC URI of a node.
    pub fn lookup_node(&self, node: &str) -> Result<String> {
        let payload = self.execute("lookupNode", &[self.caller(), Value::from(node)])?;
        Self::string("lookupNode", payload)
    }

    /// `(topic, type)` for published topics under `subgraph` (`""` = all).
    pub fn get_published_topics(&self, subgraph: &str) -> Result<Vec<(String, String)>> {
        let payload = self.execute(
            "getPublishedTopics",
            &[self.caller(), Value::from(subgraph)],
        )?;
        Self::pairs("getPublishedTopics", &payload)
    }

    /// `(topic, type)` for every known topic.
    pub fn get_topic_types(&self) -> Result<Vec<(String, String)>> {
        let payload = self.execute("getTopicTypes", &[self.caller()])?;
        Self::pairs("getTopicTypes", &payload)
    }

    pub fn get_system_state(&self) -> Result<SystemState> {
        let payload = self.execute("getSystemState", &[self.caller()])?;
        let invalid = || Error::InvalidResponse {
            method: "getSystemState".into(),
            reason: "malformed system state".into(),
        };
        let parse_section = |section: &Value| -> Result<Vec<(String, Vec<String>)>> {
            section
                .as_array()
                .ok_or_else(invalid)?
                .iter()
                .map(|entry| match entry.as_array() {
                    Some([Value::String(name), nodes]) => {
                        Ok((name.clone(), nodes.as_string_list().ok_or_else(invalid)?))
                    }
                    _ => Err(invalid()),
                })
                .collect()
        };
        match payload.as_array() {
            Some([pubs, subs, srvs]) => Ok(SystemState {
                publishers: parse_section(pubs)?,
                subscribers: parse_section(subs)?,
                services: parse_section(srvs)?,
            }),
            _ => Err(invalid()),
        }
    }

    /// The master's own URI as it reports it.
    pub fn get_uri(&self) -> Result<String> {
        let payload = self.execute("getUri", &[self.caller()])?;
        Self::string("getUri", payload)
    }

    /// True if the master answers a single `getPid` (no retry).
    pub fn check(&self) -> bool {
        self.xmlrpc
            .call(&self.uri, "getPid", &[self.caller()])
            .and_then(|r| validate_response("getPid", r))
            .is_ok()
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("uri", &self.uri)
            .field("caller_id", &self.caller_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmlrpc_manager::success;
    use parking_lot::Mutex;
    use std::net::TcpListener;

    /// Fake master on its own manager; returns (master client, fake master).
    fn setup(config: NodeConfig) -> (Master, Arc<XmlRpcManager>, Arc<XmlRpcManager>) {
        let fake = XmlRpcManager::start(&config).unwrap();
        let config = NodeConfig {
            master_uri: fake.uri().to_string(),
            ..config
        };
        let node = XmlRpcManager::start(&config).unwrap();
        (Master::new(&config, "/talker", node.clone()), fake, node)
    }

    #[test]
    fn test_register_publisher_success_no_retry() {
        let (master, fake, _node) = setup(NodeConfig::loopback("http://127.0.0.1:1/"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            fake.bind_fn("registerPublisher", move |params| {
                calls.lock().push(params.to_vec());
                success("", Value::Array(vec![]))
            });
        }

        let subs = master.register_publisher("/chatter", "std_msgs/String").unwrap();
        assert!(subs.is_empty());

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], Value::from("/talker"));
        assert_eq!(calls[0][1], Value::from("/chatter"));
        assert_eq!(calls[0][2], Value::from("std_msgs/String"));
        assert!(calls[0][3].as_str().unwrap().starts_with("http://127.0.0.1:"));
    }

    #[test]
    fn test_application_failure_not_retried() {
        let (master, fake, _node) = setup(NodeConfig::loopback("http://127.0.0.1:1/"));
        let count = Arc::new(Mutex::new(0));
        {
            let count = count.clone();
            fake.bind_fn("lookupNode", move |_| {
                *count.lock() += 1;
                Value::response(-1, "unknown node", Value::from(""))
            });
        }
        let err = master.lookup_node("/nobody").unwrap_err();
        assert!(matches!(err, Error::RpcFailed { code: -1, .. }));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_unreachable_master_times_out() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = NodeConfig::loopback(format!("http://127.0.0.1:{}/", port))
            .with_master_retry_timeout(Duration::from_millis(600));
        let node = XmlRpcManager::start(&config).unwrap();
        let master = Master::new(&config, "/talker", node);

        let start = Instant::now();
        let err = master.get_uri().unwrap_err();
        assert!(matches!(err, Error::MasterUnreachable { .. }), "{:?}", err);
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(!master.check());
    }

    #[test]
    fn test_lookup_service_and_system_state() {
        let (master, fake, _node) = setup(NodeConfig::loopback("http://127.0.0.1:1/"));
        fake.bind_fn("lookupService", |params| {
            if params.get(1) == Some(&Value::from("/add")) {
                success("", Value::from("rosrpc://127.0.0.1:4567"))
            } else {
                Value::response(-1, "no provider", Value::from(""))
            }
        });
        fake.bind_fn("getSystemState", |_| {
            let entry = |name: &str, node: &str| {
                Value::Array(vec![Value::from(name), Value::Array(vec![Value::from(node)])])
            };
            success(
                "",
                Value::Array(vec![
                    Value::Array(vec![entry("/chatter", "/talker")]),
                    Value::Array(vec![entry("/chatter", "/listener")]),
                    Value::Array(vec![]),
                ]),
            )
        });

        assert_eq!(
            master.lookup_service("/add").unwrap(),
            ("127.0.0.1".to_string(), 4567)
        );
        assert!(matches!(
            master.lookup_service("/missing"),
            Err(Error::ServiceNotFound(_))
        ));

        let state = master.get_system_state().unwrap();
        assert_eq!(state.publishers, vec![("/chatter".to_string(), vec!["/talker".to_string()])]);
        assert_eq!(state.subscribers[0].1, vec!["/listener".to_string()]);
        assert!(state.services.is_empty());
    }
}
