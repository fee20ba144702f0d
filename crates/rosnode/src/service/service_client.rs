// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed service client.
//!
//! A non-persistent client looks the service up and connects for every call.
//! A persistent client keeps its link; when a call on a reused link fails
//! because the connection dropped, it reconnects once and retries.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::service_server_link::ServiceServerLink;
use crate::error::{Error, Result};
use crate::master::Master;
use crate::message::{RosMessage, RosService};
use crate::transport::ConnectionManager;

/// Poll period of [`wait_for_service`].
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Untyped client state shared by [`ServiceClient`] clones.
pub struct RawServiceClient {
    service: String,
    md5sum: String,
    caller_id: String,
    persistent: bool,
    master: Arc<Master>,
    connections: Arc<ConnectionManager>,
    busy: AtomicBool,
    link: Mutex<Option<ServiceServerLink>>,
}

/// Clears the busy flag when the call ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RawServiceClient {
    pub fn new(
        service: &str,
        md5sum: &str,
        caller_id: &str,
        persistent: bool,
        master: Arc<Master>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            service: service.to_string(),
            md5sum: md5sum.to_string(),
            caller_id: caller_id.to_string(),
            persistent,
            master,
            connections,
            busy: AtomicBool::new(false),
            link: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn connect(&self, probe: bool) -> Result<ServiceServerLink> {
        let (host, port) = self.master.lookup_service(&self.service)?;
        ServiceServerLink::connect(
            &self.connections,
            &host,
            port,
            &self.service,
            &self.md5sum,
            &self.caller_id,
            self.persistent && !probe,
            probe,
        )
    }

    /// One request/response exchange. Fails with [`Error::ConcurrentCall`]
    /// if another call on this client is in progress.
    pub fn call_raw(&self, request: &[u8]) -> Result<Vec<u8>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::ConcurrentCall(self.service.clone()));
        }
        let _busy = BusyGuard(&self.busy);

        if !self.persistent {
            return self.connect(false)?.call(request);
        }

        let mut slot = self.link.lock();
        let reused = match slot.take() {
            Some(link) if !link.is_dropped() => Some(link),
            _ => None,
        };
        let was_reused = reused.is_some();
        let link = match reused {
            Some(link) => link,
            None => self.connect(false)?,
        };

        match link.call(request) {
            Ok(response) => {
                *slot = Some(link);
                Ok(response)
            }
            Err(e) if was_reused && e.is_connection_drop() => {
                log::debug!("[srv {}] persistent link broke ({}), reconnecting", self.service, e);
                drop(link);
                let fresh = self.connect(false)?;
                let response = fresh.call(request)?;
                *slot = Some(fresh);
                Ok(response)
            }
            Err(e @ Error::ServiceFailed { .. }) => {
                *slot = Some(link);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// True if the service is registered and answers a probe.
    pub fn exists(&self) -> bool {
        match self.connect(true) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("[srv {}] probe failed: {}", self.service, e);
                false
            }
        }
    }

    /// Persistent clients: the held link is still open.
    pub fn is_valid(&self) -> bool {
        if !self.persistent {
            return true;
        }
        match &*self.link.lock() {
            Some(link) => !link.is_dropped(),
            None => true,
        }
    }

    /// Drop the persistent link, if any.
    pub fn shutdown(&self) {
        if let Some(link) = self.link.lock().take() {
            link.close("service client shut down");
        }
    }
}

/// Block until `service` is registered and answers a probe.
/// `None` waits forever.
pub fn wait_for_service(
    master: &Arc<Master>,
    connections: &Arc<ConnectionManager>,
    caller_id: &str,
    service: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let probe = RawServiceClient::new(
        service,
        crate::topic::WILDCARD,
        caller_id,
        false,
        master.clone(),
        connections.clone(),
    );
    let start = Instant::now();
    let mut announced = false;
    loop {
        if probe.exists() {
            if announced {
                log::info!("[srv {}] is now available", service);
            }
            return Ok(());
        }
        if !connections.is_running() {
            return Err(Error::Shutdown);
        }
        if let Some(t) = timeout {
            if start.elapsed() >= t {
                return Err(Error::Timeout(format!("service {}", service)));
            }
        }
        if !announced {
            log::info!("[srv {}] not advertised yet, waiting", service);
            announced = true;
        }
        thread::sleep(WAIT_POLL);
    }
}

/// Typed handle over a [`RawServiceClient`].
pub struct ServiceClient<S: RosService> {
    raw: Arc<RawServiceClient>,
    _service: PhantomData<fn() -> S>,
}

impl<S: RosService> Clone for ServiceClient<S> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _service: PhantomData,
        }
    }
}

impl<S: RosService> ServiceClient<S> {
    pub fn new(raw: Arc<RawServiceClient>) -> Self {
        Self {
            raw,
            _service: PhantomData,
        }
    }

    pub fn service(&self) -> &str {
        self.raw.service()
    }

    pub fn call(&self, request: &S::Request) -> Result<S::Response> {
        let bytes = self.raw.call_raw(&request.to_bytes())?;
        S::Response::from_bytes(&bytes)
    }

    pub fn exists(&self) -> bool {
        self.raw.exists()
    }

    pub fn is_valid(&self) -> bool {
        self.raw.is_valid()
    }

    pub fn shutdown(&self) {
        self.raw.shutdown()
    }
}

impl<S: RosService> std::fmt::Debug for ServiceClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.raw.service)
            .field("persistent", &self.raw.persistent)
            .finish()
    }
}
