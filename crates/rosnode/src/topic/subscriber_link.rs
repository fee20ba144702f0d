// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher-side view of one subscriber.
//!
//! A transport link owns a bounded outbox drained by a dedicated writer
//! thread; when the outbox is full the oldest message is dropped. The
//! intraprocess variant hands payloads straight to the local subscription.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex};

use super::publication::Publication;
use super::subscription::Subscription;
use crate::error::Result;
use crate::message::MessagePayload;
use crate::transport::{CancelToken, Connection};

/// Counters reported through `getBusStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriberLinkStats {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

// ============================================================================
// Transport link
// ============================================================================

struct Outbox {
    items: VecDeque<MessagePayload>,
    closed: bool,
}

pub struct TransportSubscriberLink {
    id: u64,
    topic: String,
    connection: Arc<Connection>,
    destination_caller_id: String,
    max_queue: usize,
    outbox: Mutex<Outbox>,
    ready: Condvar,
    cancel: CancelToken,
    closed: AtomicBool,
    publication: Weak<Publication>,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl TransportSubscriberLink {
    pub fn new(
        connection: Arc<Connection>,
        topic: &str,
        destination_caller_id: &str,
        max_queue: usize,
        publication: Weak<Publication>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: connection.id(),
            topic: topic.to_string(),
            connection,
            destination_caller_id: destination_caller_id.to_string(),
            max_queue,
            outbox: Mutex::new(Outbox {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            publication,
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        })
    }

    /// Spawn the writer thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let link = self.clone();
        thread::Builder::new()
            .name(format!("rosnode-pub-{}", self.id))
            .spawn(move || link.writer_loop())?;
        Ok(())
    }

    fn writer_loop(self: Arc<Self>) {
        loop {
            let payload = {
                let mut outbox = self.outbox.lock();
                loop {
                    if outbox.closed {
                        return;
                    }
                    if let Some(p) = outbox.items.pop_front() {
                        break p;
                    }
                    self.ready.wait(&mut outbox);
                }
            };

            let bytes = payload.bytes();
            match self.connection.write_length_prefixed(&bytes, &self.cancel) {
                Ok(()) => {
                    self.bytes_sent
                        .fetch_add(bytes.len() as u64 + 4, Ordering::Relaxed);
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.drop_link(&format!("write failed: {}", e));
                    return;
                }
            }
        }
    }

    /// Block until the subscriber goes away. Subscribers never send after
    /// the handshake, so any read result means the link is dead.
    pub fn watch_peer(&self) {
        let reason = match self.connection.read_u8(&self.cancel) {
            Ok(_) => "unexpected data from subscriber".to_string(),
            Err(e) => format!("subscriber closed: {}", e),
        };
        if !self.closed.load(Ordering::Acquire) {
            self.drop_link(&reason);
        }
    }

    /// Queue a message; evicts the oldest when full.
    pub fn enqueue(&self, payload: MessagePayload) {
        let mut outbox = self.outbox.lock();
        if outbox.closed {
            return;
        }
        outbox.items.push_back(payload);
        if self.max_queue > 0 && outbox.items.len() > self.max_queue {
            outbox.items.pop_front();
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop(outbox);
        self.ready.notify_one();
    }

    fn drop_link(&self, reason: &str) {
        self.close(reason);
        if let Some(publication) = self.publication.upgrade() {
            publication.remove_subscriber_link(self.id);
        }
    }

    /// Stop the writer and close the socket. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(
            "[pub {}] closing link {} to {}: {}",
            self.topic,
            self.id,
            self.destination_caller_id,
            reason
        );
        self.outbox.lock().closed = true;
        self.ready.notify_all();
        self.cancel.cancel();
        self.connection.drop_connection(reason);
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn stats(&self) -> SubscriberLinkStats {
        SubscriberLinkStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Intraprocess link
// ============================================================================

pub struct LocalSubscriberLink {
    id: u64,
    destination_caller_id: String,
    subscription: Weak<Subscription>,
    latched: bool,
    closed: AtomicBool,
    messages_sent: AtomicU64,
}

impl LocalSubscriberLink {
    pub fn new(id: u64, caller_id: &str, subscription: Weak<Subscription>, latched: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            destination_caller_id: caller_id.to_string(),
            subscription,
            latched,
            closed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
        })
    }

    pub fn enqueue(&self, payload: MessagePayload) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(sub) = self.subscription.upgrade() {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
            let publisher: Arc<str> = Arc::from(self.destination_caller_id.as_str());
            sub.handle_message(payload, self.id, self.latched, publisher);
        }
    }

    /// Detach; the subscription side is told to forget its half.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sub) = self.subscription.upgrade() {
            sub.remove_publisher_link(self.id);
        }
    }
}

// ============================================================================
// Link enum
// ============================================================================

/// One subscriber of a publication.
#[derive(Clone)]
pub enum SubscriberLink {
    Transport(Arc<TransportSubscriberLink>),
    Local(Arc<LocalSubscriberLink>),
}

impl SubscriberLink {
    pub fn id(&self) -> u64 {
        match self {
            SubscriberLink::Transport(l) => l.id,
            SubscriberLink::Local(l) => l.id,
        }
    }

    /// `callerid` of the subscribing node.
    pub fn destination_caller_id(&self) -> &str {
        match self {
            SubscriberLink::Transport(l) => &l.destination_caller_id,
            SubscriberLink::Local(l) => &l.destination_caller_id,
        }
    }

    pub fn enqueue(&self, payload: MessagePayload) {
        match self {
            SubscriberLink::Transport(l) => l.enqueue(payload),
            SubscriberLink::Local(l) => l.enqueue(payload),
        }
    }

    pub fn close(&self, reason: &str) {
        match self {
            SubscriberLink::Transport(l) => l.close(reason),
            SubscriberLink::Local(l) => l.close(),
        }
    }

    pub fn is_intraprocess(&self) -> bool {
        matches!(self, SubscriberLink::Local(_))
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            SubscriberLink::Transport(_) => "TCPROS",
            SubscriberLink::Local(_) => "INTRAPROCESS",
        }
    }

    /// Human-readable connection description for `getBusInfo`.
    pub fn info(&self) -> String {
        match self {
            SubscriberLink::Transport(l) => format!(
                "TCPROS connection to [{}]",
                l.connection.remote_string()
            ),
            SubscriberLink::Local(_) => "INTRAPROCESS connection".to_string(),
        }
    }

    pub fn stats(&self) -> SubscriberLinkStats {
        match self {
            SubscriberLink::Transport(l) => l.stats(),
            SubscriberLink::Local(l) => SubscriberLinkStats {
                messages_sent: l.messages_sent.load(Ordering::Relaxed),
                ..Default::default()
            },
        }
    }
}

impl std::fmt::Debug for SubscriberLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberLink")
            .field("id", &self.id())
            .field("transport", &self.transport_name())
            .field("destination", &self.destination_caller_id())
            .finish()
    }
}
