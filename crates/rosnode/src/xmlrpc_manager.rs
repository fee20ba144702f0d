// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-wide XML-RPC endpoint.
//!
//! Owns the inbound server (the node's slave API) and a pool of idle outbound
//! clients keyed by `(host, port)`. Every component that talks XML-RPC goes
//! through here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::xmlrpc::{parse_http_uri, Handler, HandlerTable, Value, XmlRpcClient, XmlRpcServer};

/// Idle clients kept per remote endpoint.
const MAX_IDLE_PER_HOST: usize = 4;

pub struct XmlRpcManager {
    handlers: HandlerTable,
    server: XmlRpcServer,
    uri: String,
    idle: Mutex<HashMap<(String, u16), Vec<XmlRpcClient>>>,
    connect_timeout: Duration,
    io_timeout: Duration,
    shutting_down: AtomicBool,
}

impl XmlRpcManager {
    /// Bind the server on `config.bind_ip:config.xmlrpc_port`.
    pub fn start(config: &NodeConfig) -> Result<Arc<Self>> {
        let handlers: HandlerTable = Arc::new(DashMap::new());
        let server = XmlRpcServer::bind(
            SocketAddr::new(config.bind_ip, config.xmlrpc_port),
            handlers.clone(),
        )?;
        let uri = format!("http://{}:{}/", config.advertise_host, server.port());
        log::info!("[xmlrpc] node API at {}", uri);

        Ok(Arc::new(Self {
            handlers,
            server,
            uri,
            idle: Mutex::new(HashMap::new()),
            connect_timeout: config.connect_timeout,
            io_timeout: config.xmlrpc_timeout,
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// URI peers use to reach this node: `http://host:port/`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    // ========================================================================
    // Method table
    // ========================================================================

    /// Register `handler` for `method`. Returns `false` if already bound.
    pub fn bind(&self, method: &str, handler: Handler) -> bool {
        match self.handlers.entry(method.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Closure convenience for [`bind`](Self::bind).
    pub fn bind_fn<F>(&self, method: &str, f: F) -> bool
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.bind(method, Arc::new(f))
    }

    /// Remove a method. Calls already dispatched keep their own handle to the
    /// handler and complete normally.
    pub fn unbind(&self, method: &str) {
        self.handlers.remove(method);
    }

    pub fn is_bound(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    // ========================================================================
    // Outbound calls
    // ========================================================================

    fn checkout(&self, host: &str, port: u16) -> XmlRpcClient {
        let pooled = self
            .idle
            .lock()
            .get_mut(&(host.to_string(), port))
            .and_then(Vec::pop);
        pooled.unwrap_or_else(|| {
            XmlRpcClient::new(host, port, self.connect_timeout, self.io_timeout)
        })
    }

    fn release(&self, client: XmlRpcClient) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock();
        let slot = idle
            .entry((client.host().to_string(), client.port()))
            .or_default();
        if slot.len() < MAX_IDLE_PER_HOST {
            slot.push(client);
        }
    }

    /// Call `method` on the node or master at `uri`, returning the raw value.
    pub fn call(&self, uri: &str, method: &str, params: &[Value]) -> Result<Value> {
        let (host, port) = parse_http_uri(uri)?;
        let client = self.checkout(&host, port);
        match client.call(method, params) {
            Ok(value) => {
                self.release(client);
                Ok(value)
            }
            Err(e) => {
                // Faults leave the connection usable; anything else does not.
                if matches!(e, crate::xmlrpc::XmlRpcError::Fault { .. }) {
                    self.release(client);
                }
                Err(Error::XmlRpc(e))
            }
        }
    }

    /// Call and validate the `[code, message, payload]` envelope.
    pub fn call_checked(&self, uri: &str, method: &str, params: &[Value]) -> Result<Value> {
        let response = self.call(uri, method, params)?;
        validate_response(method, response)
    }

    /// Stop the server and drop pooled clients.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.server.shutdown();
        self.idle.lock().clear();
        self.handlers.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for XmlRpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlRpcManager")
            .field("uri", &self.uri)
            .field("methods", &self.handlers.len())
            .finish()
    }
}

/// Check a ROS API response: exactly `[int code, string message, payload]`
/// with `code == 1`. Returns the payload.
pub fn validate_response(method: &str, response: Value) -> Result<Value> {
    let invalid = |reason: &str| Error::InvalidResponse {
        method: method.to_string(),
        reason: reason.to_string(),
    };

    let mut items = match response {
        Value::Array(items) => items,
        _ => return Err(invalid("response is not an array")),
    };
    if items.len() != 3 {
        return Err(invalid(&format!("expected 3 elements, got {}", items.len())));
    }
    let payload = items.pop().unwrap_or(Value::Int(0));
    let message = match items.pop() {
        Some(Value::String(s)) => s,
        _ => return Err(invalid("status message is not a string")),
    };
    let code = match items.pop() {
        Some(Value::Int(code)) => code,
        _ => return Err(invalid("status code is not an int")),
    };

    if code != 1 {
        log::debug!("[xmlrpc] {} returned {}: {}", method, code, message);
        return Err(Error::RpcFailed {
            method: method.to_string(),
            code,
            message,
        });
    }
    Ok(payload)
}

/// Standard success envelope.
pub fn success(message: impl Into<String>, payload: Value) -> Value {
    Value::response(1, message, payload)
}

/// Standard error envelope (caller error).
pub fn failure(message: impl Into<String>) -> Value {
    Value::response(-1, message, Value::Int(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<XmlRpcManager> {
        XmlRpcManager::start(&NodeConfig::loopback("http://127.0.0.1:11311/")).unwrap()
    }

    #[test]
    fn test_validate_response_shapes() {
        assert_eq!(
            validate_response("m", success("", Value::Array(vec![]))).unwrap(),
            Value::Array(vec![])
        );
        assert!(matches!(
            validate_response("m", Value::response(0, "nope", Value::Int(0))),
            Err(Error::RpcFailed { code: 0, .. })
        ));
        assert!(matches!(
            validate_response("m", Value::Array(vec![Value::Int(1), Value::from("")])),
            Err(Error::InvalidResponse { .. })
        ));
        assert!(matches!(
            validate_response(
                "m",
                Value::Array(vec![Value::from("1"), Value::from(""), Value::Int(0)])
            ),
            Err(Error::InvalidResponse { .. })
        ));
        assert!(validate_response("m", Value::Int(1)).is_err());
    }

    #[test]
    fn test_bind_call_unbind() {
        let mgr = manager();
        assert!(mgr.uri().starts_with("http://127.0.0.1:"));
        assert!(mgr.bind_fn("getPid", |_| success("", Value::Int(42))));
        assert!(!mgr.bind_fn("getPid", |_| success("", Value::Int(0))));

        let uri = mgr.uri().to_string();
        let pid = mgr.call_checked(&uri, "getPid", &[Value::from("/t")]).unwrap();
        assert_eq!(pid, Value::Int(42));
        // Second call reuses a pooled client.
        assert_eq!(
            mgr.call_checked(&uri, "getPid", &[Value::from("/t")]).unwrap(),
            Value::Int(42)
        );

        mgr.unbind("getPid");
        assert!(!mgr.is_bound("getPid"));
        assert!(mgr.call(&uri, "getPid", &[]).is_err());
        mgr.shutdown();
    }

    #[test]
    fn test_unbind_during_call_completes() {
        let mgr = manager();
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let rx = Mutex::new(rx);
        mgr.bind_fn("slow", move |_| {
            let _ = rx.lock().recv_timeout(Duration::from_secs(2));
            success("done", Value::Int(1))
        });

        let uri = mgr.uri().to_string();
        let caller = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.call_checked(&uri, "slow", &[]))
        };
        std::thread::sleep(Duration::from_millis(100));
        mgr.unbind("slow");
        let _ = tx.send(());
        assert_eq!(caller.join().unwrap().unwrap(), Value::Int(1));
        mgr.shutdown();
    }
}
