// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter server access.
//!
//! Plain reads go straight to the master. `get_cached` subscribes to the key
//! on first use; the master then pushes changes through `paramUpdate`, and
//! later reads are served locally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::master::Master;
use crate::names;
use crate::xmlrpc::Value;
use crate::xmlrpc_manager::{success, XmlRpcManager};

/// Status code the master uses for "parameter is not set".
const CODE_NOT_SET: i32 = -1;

#[derive(Default)]
struct CacheState {
    values: HashMap<String, Value>,
    subscribed: HashSet<String>,
}

pub struct Param {
    master: Arc<Master>,
    xmlrpc: Arc<XmlRpcManager>,
    namespace: String,
    node_name: String,
    cache: Mutex<CacheState>,
}

impl Param {
    pub fn new(
        master: Arc<Master>,
        xmlrpc: Arc<XmlRpcManager>,
        namespace: &str,
        node_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            master,
            xmlrpc,
            namespace: namespace.to_string(),
            node_name: node_name.to_string(),
            cache: Mutex::new(CacheState::default()),
        })
    }

    /// Bind `paramUpdate` on the node's XML-RPC server.
    pub fn bind_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.xmlrpc.bind_fn("paramUpdate", move |params| {
            match (weak.upgrade(), params) {
                (Some(param), [_caller, Value::String(key), value]) => {
                    param.update(key, value.clone());
                    success("", Value::Int(0))
                }
                (Some(_), _) => Value::response(-1, "paramUpdate: bad arguments", Value::Int(0)),
                (None, _) => Value::response(0, "node is shutting down", Value::Int(0)),
            }
        });
    }

    fn resolve(&self, key: &str) -> Result<String> {
        names::resolve(&self.namespace, &self.node_name, key)
    }

    fn caller(&self) -> Value {
        Value::from(self.master.caller_id())
    }

    fn not_set(key: &str, e: Error) -> Error {
        match e {
            Error::RpcFailed { code: CODE_NOT_SET, .. } => Error::ParamNotFound(key.to_string()),
            other => other,
        }
    }

    // ========================================================================
    // Direct access
    // ========================================================================

    pub fn get(&self, key: &str) -> Result<Value> {
        let key = self.resolve(key)?;
        self.master
            .execute("getParam", &[self.caller(), Value::from(key.as_str())])
            .map_err(|e| Self::not_set(&key, e))
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let key = self.resolve(key)?;
        self.master
            .execute("setParam", &[self.caller(), Value::from(key.as_str()), value])?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let key = self.resolve(key)?;
        self.master
            .execute("deleteParam", &[self.caller(), Value::from(key.as_str())])
            .map_err(|e| Self::not_set(&key, e))?;
        self.cache.lock().values.remove(&key);
        Ok(())
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        let key = self.resolve(key)?;
        let payload = self
            .master
            .execute("hasParam", &[self.caller(), Value::from(key.as_str())])?;
        payload.as_bool().ok_or_else(|| Error::InvalidResponse {
            method: "hasParam".into(),
            reason: "payload is not a boolean".into(),
        })
    }

    /// Search up the namespace tree; `None` if no ancestor has the key.
    pub fn search(&self, key: &str) -> Result<Option<String>> {
        match self
            .master
            .execute("searchParam", &[self.caller(), Value::from(key)])
        {
            Ok(Value::String(found)) if !found.is_empty() => Ok(Some(found)),
            Ok(_) => Ok(None),
            Err(Error::RpcFailed { code: CODE_NOT_SET, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_names(&self) -> Result<Vec<String>> {
        let payload = self.master.execute("getParamNames", &[self.caller()])?;
        payload.as_string_list().ok_or_else(|| Error::InvalidResponse {
            method: "getParamNames".into(),
            reason: "payload is not a list of strings".into(),
        })
    }

    // ========================================================================
    // Cached access
    // ========================================================================

    /// Read through the local cache, subscribing on first use.
    pub fn get_cached(&self, key: &str) -> Result<Value> {
        let key = self.resolve(key)?;
        let subscribed = {
            let cache = self.cache.lock();
            if let Some(v) = cache.values.get(&key) {
                return Ok(v.clone());
            }
            cache.subscribed.contains(&key)
        };

        let value = if subscribed {
            self.get(&key)?
        } else {
            let v = self.master.execute(
                "subscribeParam",
                &[
                    self.caller(),
                    Value::from(self.xmlrpc.uri()),
                    Value::from(key.as_str()),
                ],
            )?;
            self.cache.lock().subscribed.insert(key.clone());
            v
        };

        // An empty struct is how the master says "subscribed, but not set".
        if matches!(&value, Value::Struct(m) if m.is_empty()) {
            return Err(Error::ParamNotFound(key));
        }
        self.cache.lock().values.insert(key, value.clone());
        Ok(value)
    }

    /// Apply a pushed update: cache the new value, forget stale ancestors and
    /// descendants.
    pub fn update(&self, key: &str, value: Value) {
        let key = names::clean(key);
        log::debug!("[param] update {}", key);
        let mut cache = self.cache.lock();
        let prefix = format!("{}/", key);
        cache.values.retain(|cached, _| {
            let descendant = cached.starts_with(&prefix);
            let ancestor = cached == "/" || key.starts_with(&format!("{}/", cached));
            !(descendant || ancestor)
        });
        if !matches!(&value, Value::Struct(m) if m.is_empty()) {
            cache.values.insert(key, value);
        }
    }

    /// Cancel every `subscribeParam` made by this node.
    pub fn unsubscribe_all(&self) {
        let keys: Vec<String> = {
            let mut cache = self.cache.lock();
            cache.values.clear();
            cache.subscribed.drain().collect()
        };
        for key in keys {
            if let Err(e) = self.master.execute(
                "unsubscribeParam",
                &[
                    self.caller(),
                    Value::from(self.xmlrpc.uri()),
                    Value::from(key.as_str()),
                ],
            ) {
                log::debug!("[param] unsubscribe {} failed: {}", key, e);
            }
        }
    }

    // ========================================================================
    // Typed getters
    // ========================================================================

    fn typed<T>(&self, key: &str, kind: &str, f: impl FnOnce(&Value) -> Option<T>) -> Result<T> {
        let value = self.get(key)?;
        f(&value).ok_or_else(|| Error::InvalidResponse {
            method: "getParam".into(),
            reason: format!("{} is not {}", key, kind),
        })
    }

    pub fn get_i32(&self, key: &str) -> Result<i32> {
        self.typed(key, "an int", Value::as_i32)
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.typed(key, "a double", Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.typed(key, "a boolean", |v| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        })
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        self.typed(key, "a string", |v| v.as_str().map(str::to_string))
    }

    pub fn get_string_list(&self, key: &str) -> Result<Vec<String>> {
        self.typed(key, "a list of strings", Value::as_string_list)
    }

    /// `get` with a fallback for unset keys.
    pub fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        match self.get(key) {
            Err(Error::ParamNotFound(_)) => Ok(default),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use std::collections::BTreeMap;

    /// In-memory parameter server exposing the master param API.
    fn fake_param_server(fake: &XmlRpcManager) -> Arc<Mutex<HashMap<String, Value>>> {
        let store: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let s = store.clone();
        fake.bind_fn("getParam", move |p| match s.lock().get(p[1].as_str().unwrap_or("")) {
            Some(v) => success("", v.clone()),
            None => Value::response(-1, "not set", Value::Int(0)),
        });
        let s = store.clone();
        fake.bind_fn("setParam", move |p| {
            s.lock().insert(p[1].as_str().unwrap_or("").to_string(), p[2].clone());
            success("", Value::Int(0))
        });
        let s = store.clone();
        fake.bind_fn("hasParam", move |p| {
            success("", Value::Bool(s.lock().contains_key(p[1].as_str().unwrap_or(""))))
        });
        let s = store.clone();
        fake.bind_fn("subscribeParam", move |p| {
            let v = s.lock().get(p[2].as_str().unwrap_or("")).cloned();
            success("", v.unwrap_or_else(|| Value::Struct(BTreeMap::new())))
        });
        fake.bind_fn("unsubscribeParam", |_| success("", Value::Int(1)));
        let s = store.clone();
        fake.bind_fn("getParamNames", move |_| {
            let mut names: Vec<String> = s.lock().keys().cloned().collect();
            names.sort();
            success("", Value::Array(names.into_iter().map(Value::from).collect()))
        });
        store
    }

    fn setup() -> (Arc<Param>, Arc<XmlRpcManager>, Arc<Mutex<HashMap<String, Value>>>) {
        let base = NodeConfig::loopback("http://127.0.0.1:1/");
        let fake = XmlRpcManager::start(&base).unwrap();
        let store = fake_param_server(&fake);
        let config = NodeConfig::loopback(fake.uri());
        let node = XmlRpcManager::start(&config).unwrap();
        let master = Arc::new(Master::new(&config, "/ns/node", node.clone()));
        let param = Param::new(master, node, "/ns", "/ns/node");
        param.bind_handlers();
        (param, fake, store)
    }

    #[test]
    fn test_set_get_has() {
        let (param, _fake, store) = setup();
        param.set("rate", Value::Int(10)).unwrap();
        assert!(store.lock().contains_key("/ns/rate"));
        assert_eq!(param.get_i32("rate").unwrap(), 10);
        assert!(param.has("rate").unwrap());
        assert!(!param.has("missing").unwrap());
        assert!(matches!(param.get("missing"), Err(Error::ParamNotFound(_))));
        assert_eq!(param.get_or("missing", Value::Int(3)).unwrap(), Value::Int(3));
        assert!(param.get_string("rate").is_err());
        param.set("~private", Value::from("x")).unwrap();
        assert_eq!(param.get_names().unwrap(), vec!["/ns/node/private", "/ns/rate"]);
    }

    #[test]
    fn test_cached_get_and_update() {
        let (param, _fake, store) = setup();
        store.lock().insert("/ns/gain".into(), Value::Double(0.5));

        assert_eq!(param.get_cached("gain").unwrap(), Value::Double(0.5));
        // Changed behind our back: cache still answers.
        store.lock().insert("/ns/gain".into(), Value::Double(0.9));
        assert_eq!(param.get_cached("gain").unwrap(), Value::Double(0.5));

        param.update("/ns/gain", Value::Double(0.9));
        assert_eq!(param.get_cached("gain").unwrap(), Value::Double(0.9));

        assert!(matches!(param.get_cached("unset"), Err(Error::ParamNotFound(_))));
        param.unsubscribe_all();
    }

    #[test]
    fn test_update_invalidates_ancestors() {
        let (param, _fake, store) = setup();
        let mut tree = BTreeMap::new();
        tree.insert("x".to_string(), Value::Int(1));
        store.lock().insert("/ns/pose".into(), Value::Struct(tree));
        param.get_cached("pose").unwrap();

        param.update("/ns/pose/x", Value::Int(2));
        // Parent evicted, refetched from the server on next read.
        let mut tree = BTreeMap::new();
        tree.insert("x".to_string(), Value::Int(2));
        store.lock().insert("/ns/pose".into(), Value::Struct(tree.clone()));
        assert_eq!(param.get_cached("pose").unwrap(), Value::Struct(tree));
    }

    #[test]
    fn test_param_update_over_xmlrpc() {
        let (param, fake, _store) = setup();
        let node_uri = param.xmlrpc.uri().to_string();
        let reply = fake
            .call_checked(
                &node_uri,
                "paramUpdate",
                &[Value::from("/master"), Value::from("/ns/speed"), Value::Int(4)],
            )
            .unwrap();
        assert_eq!(reply, Value::Int(0));
        assert_eq!(param.get_cached("speed").unwrap(), Value::Int(4));
    }
}
