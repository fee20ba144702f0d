// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber-side view of one publisher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use super::publication::Publication;
use super::subscription::Subscription;
use crate::error::{Error, Result};
use crate::message::MessagePayload;
use crate::transport::{CancelToken, Connection};

/// Counters reported through `getBusStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublisherLinkStats {
    pub bytes_received: u64,
    pub messages_received: u64,
}

// ============================================================================
// Transport link
// ============================================================================

pub struct TransportPublisherLink {
    id: u64,
    topic: String,
    publisher_uri: String,
    caller_id: Arc<str>,
    latched: bool,
    connection: Arc<Connection>,
    cancel: CancelToken,
    closed: AtomicBool,
    subscription: Weak<Subscription>,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
}

impl TransportPublisherLink {
    /// Wrap a connection whose handshake already completed.
    pub fn new(
        connection: Arc<Connection>,
        topic: &str,
        publisher_uri: &str,
        subscription: Weak<Subscription>,
    ) -> Arc<Self> {
        let header = connection.remote_header();
        let caller_id = header
            .get(crate::transport::header::keys::CALLERID)
            .cloned()
            .unwrap_or_default();
        let latched = header
            .get(crate::transport::header::keys::LATCHING)
            .map(|v| v == "1")
            .unwrap_or(false);
        Arc::new(Self {
            id: connection.id(),
            topic: topic.to_string(),
            publisher_uri: publisher_uri.to_string(),
            caller_id: Arc::from(caller_id.as_str()),
            latched,
            connection,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            subscription,
            bytes_received: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spawn the reader thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let link = self.clone();
        thread::Builder::new()
            .name(format!("rosnode-sub-{}", self.id))
            .spawn(move || link.reader_loop())?;
        Ok(())
    }

    fn reader_loop(self: Arc<Self>) {
        loop {
            match self.connection.read_length_prefixed(&self.cancel) {
                Ok(bytes) => {
                    self.bytes_received
                        .fetch_add(bytes.len() as u64 + 4, Ordering::Relaxed);
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    match self.subscription.upgrade() {
                        Some(sub) => sub.handle_message(
                            MessagePayload::from_bytes(bytes),
                            self.id,
                            self.latched,
                            self.caller_id.clone(),
                        ),
                        None => return,
                    }
                }
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let reason = match &e {
                        Error::MessageSizeLimit { .. } => format!("oversized message: {}", e),
                        _ => format!("read failed: {}", e),
                    };
                    self.close(&reason);
                    if let Some(sub) = self.subscription.upgrade() {
                        sub.on_publisher_link_dropped(self.id, &self.publisher_uri);
                    }
                    return;
                }
            }
        }
    }

    /// Stop reading and close the socket. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(
            "[sub {}] closing link {} to {}: {}",
            self.topic,
            self.id,
            self.publisher_uri,
            reason
        );
        self.cancel.cancel();
        self.connection.drop_connection(reason);
    }
}

// ============================================================================
// Intraprocess link
// ============================================================================

pub struct LocalPublisherLink {
    id: u64,
    publisher_uri: String,
    caller_id: Arc<str>,
    latched: bool,
    publication: Weak<Publication>,
    closed: AtomicBool,
}

impl LocalPublisherLink {
    pub fn new(id: u64, publisher_uri: &str, caller_id: &str, publication: &Arc<Publication>) -> Arc<Self> {
        Arc::new(Self {
            id,
            publisher_uri: publisher_uri.to_string(),
            caller_id: Arc::from(caller_id),
            latched: publication.is_latching(),
            publication: Arc::downgrade(publication),
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(publication) = self.publication.upgrade() {
            publication.remove_subscriber_link(self.id);
        }
    }
}

// ============================================================================
// Link enum
// ============================================================================

/// One publisher feeding a subscription.
#[derive(Clone)]
pub enum PublisherLink {
    Transport(Arc<TransportPublisherLink>),
    Local(Arc<LocalPublisherLink>),
}

impl PublisherLink {
    pub fn id(&self) -> u64 {
        match self {
            PublisherLink::Transport(l) => l.id,
            PublisherLink::Local(l) => l.id,
        }
    }

    /// XML-RPC URI of the publishing node.
    pub fn publisher_uri(&self) -> &str {
        match self {
            PublisherLink::Transport(l) => &l.publisher_uri,
            PublisherLink::Local(l) => &l.publisher_uri,
        }
    }

    pub fn caller_id(&self) -> &Arc<str> {
        match self {
            PublisherLink::Transport(l) => &l.caller_id,
            PublisherLink::Local(l) => &l.caller_id,
        }
    }

    pub fn is_latched(&self) -> bool {
        match self {
            PublisherLink::Transport(l) => l.latched,
            PublisherLink::Local(l) => l.latched,
        }
    }

    pub fn is_intraprocess(&self) -> bool {
        matches!(self, PublisherLink::Local(_))
    }

    pub fn close(&self, reason: &str) {
        match self {
            PublisherLink::Transport(l) => l.close(reason),
            PublisherLink::Local(l) => l.close(),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            PublisherLink::Transport(_) => "TCPROS",
            PublisherLink::Local(_) => "INTRAPROCESS",
        }
    }

    pub fn info(&self) -> String {
        match self {
            PublisherLink::Transport(l) => format!(
                "TCPROS connection to [{}]",
                l.connection.remote_string()
            ),
            PublisherLink::Local(_) => "INTRAPROCESS connection".to_string(),
        }
    }

    pub fn stats(&self) -> PublisherLinkStats {
        match self {
            PublisherLink::Transport(l) => PublisherLinkStats {
                bytes_received: l.bytes_received.load(Ordering::Relaxed),
                messages_received: l.messages_received.load(Ordering::Relaxed),
            },
            PublisherLink::Local(_) => PublisherLinkStats::default(),
        }
    }
}

impl std::fmt::Debug for PublisherLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherLink")
            .field("id", &self.id())
            .field("transport", &self.transport_name())
            .field("publisher_uri", &self.publisher_uri())
            .finish()
    }
}
