// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One advertised service.
//!
//! Requests are executed on the node's callback queue. The link that
//! received a request blocks on a reply channel until the handler ran, so a
//! single connection never has two requests in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use parking_lot::Mutex;

use super::service_client_link::ServiceClientLink;
use crate::callback_queue::{CallbackEntry, CallbackKind, CallbackQueue, OwnerId};

/// Raw request bytes in, raw response bytes (or an error message) out.
pub type ServiceHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Counters reported in the service section of `getBusStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

pub struct ServicePublication {
    name: String,
    md5sum: String,
    datatype: String,
    request_type: String,
    response_type: String,
    handler: ServiceHandler,
    queue: Arc<CallbackQueue>,
    owner_id: OwnerId,
    dropped: AtomicBool,
    links: Mutex<Vec<Arc<ServiceClientLink>>>,
    requests: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServicePublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        md5sum: &str,
        datatype: &str,
        request_type: &str,
        response_type: &str,
        handler: ServiceHandler,
        queue: Arc<CallbackQueue>,
        owner_id: OwnerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            md5sum: md5sum.to_string(),
            datatype: datatype.to_string(),
            request_type: request_type.to_string(),
            response_type: response_type.to_string(),
            handler,
            queue,
            owner_id,
            dropped: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Run the handler on the callback queue and wait for its result.
    pub fn process_request(&self, request: Vec<u8>) -> Result<Vec<u8>, String> {
        if self.is_dropped() {
            return Err(format!("service [{}] is shutting down", self.name));
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(request.len() as u64, Ordering::Relaxed);

        let (tx, rx) = channel::bounded(1);
        let handler = self.handler.clone();
        let entry = CallbackEntry::new(
            self.owner_id,
            CallbackKind::ServiceCall(Box::new(move || {
                let _ = tx.send(handler(&request));
            })),
        );
        self.queue.add_callback(entry, 0);

        // The sender is dropped unrun when the entry is removed from the queue.
        let reply = rx
            .recv()
            .unwrap_or_else(|_| Err(format!("service [{}] was shut down", self.name)));
        if let Ok(bytes) = &reply {
            self.bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        reply
    }

    pub fn add_link(&self, link: Arc<ServiceClientLink>) {
        self.links.lock().push(link);
    }

    pub fn remove_link(&self, id: u64) {
        self.links.lock().retain(|l| l.id() != id);
    }

    pub fn num_links(&self) -> usize {
        self.links.lock().len()
    }

    /// Close every client link and discard queued requests.
    pub fn drop_publication(&self) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        let links = std::mem::take(&mut *self.links.lock());
        for link in links {
            link.close("service unadvertised");
        }
        self.queue.remove_by_id(self.owner_id);
        log::debug!("[srv {}] dropped", self.name);
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ServicePublication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePublication")
            .field("name", &self.name)
            .field("type", &self.datatype)
            .field("links", &self.num_links())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn echo_upper(queue: Arc<CallbackQueue>) -> Arc<ServicePublication> {
        ServicePublication::new(
            "/upper",
            "0123456789abcdef0123456789abcdef",
            "test_srvs/Upper",
            "test_srvs/UpperRequest",
            "test_srvs/UpperResponse",
            Arc::new(|req: &[u8]| {
                if req.is_empty() {
                    Err("empty request".to_string())
                } else {
                    Ok(req.to_ascii_uppercase())
                }
            }),
            queue,
            crate::callback_queue::next_owner_id(),
        )
    }

    #[test]
    fn test_request_runs_on_queue() {
        let queue = Arc::new(CallbackQueue::new());
        let publication = echo_upper(queue.clone());
        let p = publication.clone();
        let caller = thread::spawn(move || p.process_request(b"abc".to_vec()));

        let mut spins = 0;
        while queue.call_available(Duration::from_millis(50)) == 0 {
            spins += 1;
            assert!(spins < 100, "request never queued");
        }
        assert_eq!(caller.join().unwrap(), Ok(b"ABC".to_vec()));
        let stats = publication.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.bytes_sent, 3);
    }

    #[test]
    fn test_handler_error_is_returned() {
        let queue = Arc::new(CallbackQueue::new());
        let publication = echo_upper(queue.clone());
        let p = publication.clone();
        let caller = thread::spawn(move || p.process_request(Vec::new()));
        while queue.call_available(Duration::from_millis(50)) == 0 {}
        assert_eq!(caller.join().unwrap(), Err("empty request".to_string()));
    }

    #[test]
    fn test_drop_releases_waiting_request() {
        let queue = Arc::new(CallbackQueue::new());
        let publication = echo_upper(queue.clone());
        let p = publication.clone();
        let caller = thread::spawn(move || p.process_request(b"x".to_vec()));
        while queue.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        publication.drop_publication();
        assert!(caller.join().unwrap().is_err());
        assert!(publication.process_request(b"y".to_vec()).is_err());
    }
}
