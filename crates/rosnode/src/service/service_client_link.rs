// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side view of one service client connection.
//!
//! ```text
//! client                         server
//!   | u32 len ++ request  ----->   |
//!   |                              | handler (callback queue)
//!   | <----- u8 ok ++ u32 len ++   |
//!   |        response | error      |
//! ```
//!
//! Non-persistent clients send one request; persistent ones keep the
//! connection for any number of sequential requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::service_publication::ServicePublication;
use crate::error::Result;
use crate::transport::{CancelToken, Connection};

pub struct ServiceClientLink {
    id: u64,
    connection: Arc<Connection>,
    caller_id: String,
    persistent: bool,
    cancel: CancelToken,
    closed: AtomicBool,
    publication: Weak<ServicePublication>,
}

impl ServiceClientLink {
    pub fn new(
        connection: Arc<Connection>,
        caller_id: &str,
        persistent: bool,
        publication: &Arc<ServicePublication>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: connection.id(),
            connection,
            caller_id: caller_id.to_string(),
            persistent,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            publication: Arc::downgrade(publication),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Serve requests until the client leaves (or after one request when
    /// not persistent). Runs on the inbound connection thread.
    pub fn serve(&self) {
        loop {
            let request = match self.connection.read_length_prefixed(&self.cancel) {
                Ok(r) => r,
                Err(e) => {
                    if !self.closed.load(Ordering::Acquire) {
                        log::debug!("[srv] client {} went away: {}", self.caller_id, e);
                    }
                    break;
                }
            };
            let publication = match self.publication.upgrade() {
                Some(p) => p,
                None => break,
            };
            let reply = publication.process_request(request);
            if let Err(e) = self.write_reply(reply) {
                log::debug!("[srv {}] reply to {} failed: {}", publication.name(), self.caller_id, e);
                break;
            }
            if !self.persistent {
                break;
            }
        }
        self.close("client link finished");
        if let Some(publication) = self.publication.upgrade() {
            publication.remove_link(self.id);
        }
    }

    fn write_reply(&self, reply: std::result::Result<Vec<u8>, String>) -> Result<()> {
        let (ok, body) = match reply {
            Ok(bytes) => (1u8, bytes),
            Err(message) => (0u8, message.into_bytes()),
        };
        self.connection.write_framed(&[ok], &body, &self.cancel)
    }

    /// Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.connection.drop_connection(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback_queue::{next_owner_id, CallbackQueue};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reply_counts_as_sent_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let client = Connection::new(1, client, 1024, None).unwrap();
        let server = Arc::new(Connection::new(2, server, 1024, None).unwrap());

        let queue = Arc::new(CallbackQueue::new());
        let publication = ServicePublication::new(
            "/upper",
            "0123456789abcdef0123456789abcdef",
            "test_srvs/Upper",
            "test_srvs/UpperRequest",
            "test_srvs/UpperResponse",
            Arc::new(|req: &[u8]| Ok::<_, String>(req.to_ascii_uppercase())),
            queue.clone(),
            next_owner_id(),
        );
        let link = ServiceClientLink::new(server.clone(), "/caller", false, &publication);
        let serving = thread::spawn(move || link.serve());

        let cancel = CancelToken::new();
        client.write_length_prefixed(b"abc", &cancel).unwrap();
        while queue.call_available(Duration::from_millis(50)) == 0 {}
        assert_eq!(client.read_u8(&cancel).unwrap(), 1);
        assert_eq!(client.read_length_prefixed(&cancel).unwrap(), b"ABC");
        serving.join().unwrap();

        let stats = server.stats();
        assert_eq!(stats.blocks_sent, 1);
        assert_eq!(stats.blocks_received, 1);
        assert_eq!(stats.bytes_sent, 8);
    }
}
