// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node registry of advertised services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::service_client_link::ServiceClientLink;
use super::service_publication::{ServiceHandler, ServicePublication, ServiceStats};
use crate::callback_queue::{CallbackQueue, OwnerId};
use crate::error::{Error, Result};
use crate::master::Master;
use crate::topic::WILDCARD;
use crate::transport::header::{self, keys, HeaderMap};
use crate::transport::{reject, CancelToken, Connection, ConnectionManager};

/// Everything needed to advertise a service.
#[derive(Clone)]
pub struct AdvertiseServiceOptions {
    pub service: String,
    pub md5sum: String,
    pub datatype: String,
    pub request_type: String,
    pub response_type: String,
    pub handler: ServiceHandler,
    pub queue: Arc<CallbackQueue>,
}

pub struct ServiceManager {
    node_name: String,
    master: Arc<Master>,
    connections: Arc<ConnectionManager>,
    registry: Mutex<HashMap<String, Arc<ServicePublication>>>,
    shutting_down: AtomicBool,
}

impl ServiceManager {
    pub fn new(node_name: &str, master: Arc<Master>, connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.to_string(),
            master,
            connections,
            registry: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// `rosrpc://host:port` of this node's TCPROS server.
    pub fn service_uri(&self) -> String {
        format!(
            "rosrpc://{}:{}",
            self.connections.advertise_host(),
            self.connections.tcpros_port()
        )
    }

    pub fn advertise_service(&self, opts: AdvertiseServiceOptions, owner: OwnerId) -> Result<Arc<ServicePublication>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let publication = {
            let mut registry = self.registry.lock();
            if registry.contains_key(&opts.service) {
                return Err(Error::AlreadyAdvertised(opts.service));
            }
            let publication = ServicePublication::new(
                &opts.service,
                &opts.md5sum,
                &opts.datatype,
                &opts.request_type,
                &opts.response_type,
                opts.handler,
                opts.queue,
                owner,
            );
            registry.insert(opts.service.clone(), publication.clone());
            publication
        };

        if let Err(e) = self.master.register_service(&opts.service, &self.service_uri()) {
            self.registry.lock().remove(&opts.service);
            publication.drop_publication();
            return Err(e);
        }
        log::info!("[services] advertised {} [{}]", opts.service, opts.datatype);
        Ok(publication)
    }

    pub fn unadvertise_service(&self, service: &str) -> Result<()> {
        let publication = self
            .registry
            .lock()
            .remove(service)
            .ok_or_else(|| Error::NotAdvertised(service.to_string()))?;
        publication.drop_publication();
        self.master.unregister_service(service, &self.service_uri())?;
        log::info!("[services] unadvertised {}", service);
        Ok(())
    }

    pub fn lookup_service_publication(&self, service: &str) -> Option<Arc<ServicePublication>> {
        self.registry.lock().get(service).cloned()
    }

    pub fn advertised_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Summed counters over every service: `(requests, bytes in, bytes out)`.
    pub fn bus_stats(&self) -> ServiceStats {
        self.registry
            .lock()
            .values()
            .map(|p| p.stats())
            .fold(ServiceStats::default(), |acc, s| ServiceStats {
                requests: acc.requests + s.requests,
                bytes_received: acc.bytes_received + s.bytes_received,
                bytes_sent: acc.bytes_sent + s.bytes_sent,
            })
    }

    /// Handshake with a client that connected to us and serve it. Runs on
    /// the inbound connection thread.
    pub fn handle_client_connection(&self, conn: Arc<Connection>, header: HeaderMap) {
        let cancel = CancelToken::new();
        let service = header.get(keys::SERVICE).cloned().unwrap_or_default();
        let caller = header
            .get(keys::CALLERID)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let publication = match self.lookup_service_publication(&service) {
            Some(p) if !p.is_dropped() => p,
            _ => {
                let msg = format!(
                    "received a connection for a nonexistent service [{}]",
                    service
                );
                reject(&conn, &msg, &cancel);
                return;
            }
        };

        let md5 = header.get(keys::MD5SUM).cloned().unwrap_or_default();
        if md5 != WILDCARD && md5 != publication.md5sum() {
            let msg = format!(
                "client [{}] wants service [{}] to have md5sum [{}], but it has [{}]",
                caller,
                service,
                md5,
                publication.md5sum()
            );
            log::warn!("[services] {}", msg);
            reject(&conn, &msg, &cancel);
            return;
        }

        let reply = header::from_pairs([
            (keys::CALLERID, self.node_name.clone()),
            (keys::MD5SUM, publication.md5sum().to_string()),
            (keys::TYPE, publication.datatype().to_string()),
            (keys::REQUEST_TYPE, publication.request_type().to_string()),
            (keys::RESPONSE_TYPE, publication.response_type().to_string()),
        ]);
        if let Err(e) = conn.write_header(&reply, &cancel) {
            log::debug!("[services] handshake reply to {} failed: {}", caller, e);
            conn.drop_connection("handshake reply failed");
            return;
        }

        if header.get(keys::PROBE).map(String::as_str) == Some("1") {
            conn.drop_connection("probe answered");
            return;
        }

        let persistent = header.get(keys::PERSISTENT).map(String::as_str) == Some("1");
        let link = ServiceClientLink::new(conn, &caller, persistent, &publication);
        publication.add_link(link.clone());
        link.serve();
    }

    /// Drop every service and unregister it.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let services: Vec<_> = self.registry.lock().drain().collect();
        let uri = self.service_uri();
        for (name, publication) in services {
            publication.drop_publication();
            if let Err(e) = self.master.unregister_service(&name, &uri) {
                log::debug!("[services] unregisterService {} failed: {}", name, e);
            }
        }
        log::debug!("[services] shut down");
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("node", &self.node_name)
            .field("services", &self.registry.lock().len())
            .finish()
    }
}
