// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One advertised topic.
//!
//! A publication fans every message out to its subscriber links, remembers
//! the last message when latching, and stamps the sequence number of
//! messages that carry a header. At most one exists per topic per node; the
//! advertise handles referencing it are counted by the topic manager.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::subscriber_link::SubscriberLink;
use crate::callback_queue::{CallbackEntry, CallbackKind, CallbackQueue, OwnerId};
use crate::error::{Error, Result};
use crate::message::{MessagePayload, RosMessage, Time};

/// Peer connect / disconnect callback.
pub type PeerCallback = Arc<dyn Fn(&PeerPublisher) + Send + Sync>;

/// Connect / disconnect callbacks registered by one advertise handle.
#[derive(Clone, Default)]
pub struct SubscriberStatusCallbacks {
    pub on_connect: Option<PeerCallback>,
    pub on_disconnect: Option<PeerCallback>,
}

impl SubscriberStatusCallbacks {
    pub fn is_empty(&self) -> bool {
        self.on_connect.is_none() && self.on_disconnect.is_none()
    }
}

/// Handed to peer callbacks: identifies the subscriber and allows sending to
/// it alone.
pub struct PeerPublisher {
    topic: String,
    link: SubscriberLink,
}

impl PeerPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `callerid` of the subscriber that connected or disconnected.
    pub fn subscriber_name(&self) -> &str {
        self.link.destination_caller_id()
    }

    /// Send `msg` to this subscriber only.
    pub fn publish<M: RosMessage>(&self, msg: M) {
        self.link.enqueue(MessagePayload::from_message(Arc::new(msg)));
    }
}

/// Stats for one subscriber link, as reported in `getBusStats`.
#[derive(Clone, Debug)]
pub struct PublicationLinkStats {
    pub id: u64,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub connected: bool,
}

/// `getBusInfo` row.
#[derive(Clone, Debug)]
pub struct PublicationLinkInfo {
    pub id: u64,
    pub destination: String,
    pub transport: &'static str,
    pub info: String,
}

struct PubState {
    links: Vec<SubscriberLink>,
    latched: Option<MessagePayload>,
    status_callbacks: Vec<(OwnerId, SubscriberStatusCallbacks)>,
}

pub struct Publication {
    name: String,
    datatype: String,
    md5sum: String,
    message_definition: String,
    max_queue: usize,
    latch: bool,
    has_header: bool,
    seq: AtomicU32,
    messages_published: AtomicU64,
    dropped: AtomicBool,
    queue: Arc<CallbackQueue>,
    state: Mutex<PubState>,
}

impl Publication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        datatype: &str,
        md5sum: &str,
        message_definition: &str,
        max_queue: usize,
        latch: bool,
        has_header: bool,
        queue: Arc<CallbackQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            datatype: datatype.to_string(),
            md5sum: md5sum.to_string(),
            message_definition: message_definition.to_string(),
            max_queue,
            latch,
            has_header,
            seq: AtomicU32::new(0),
            messages_published: AtomicU64::new(0),
            dropped: AtomicBool::new(false),
            queue,
            state: Mutex::new(PubState {
                links: Vec::new(),
                latched: None,
                status_callbacks: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    pub fn message_definition(&self) -> &str {
        &self.message_definition
    }

    pub fn is_latching(&self) -> bool {
        self.latch
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn num_subscribers(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Caller ids of connected subscribers (one entry per link).
    pub fn subscriber_names(&self) -> Vec<String> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| l.destination_caller_id().to_string())
            .collect()
    }

    /// Sequence number the next message will get.
    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Stamp, then enqueue a typed message.
    pub fn publish<M: RosMessage>(&self, mut msg: M) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::NotAdvertised(self.name.clone()));
        }
        let mut state = self.state.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Some(header) = msg.header_mut() {
            header.seq = seq;
            if header.stamp.is_zero() {
                header.stamp = Time::now();
            }
        }
        self.enqueue_locked(&mut state, MessagePayload::from_message(Arc::new(msg)));
        Ok(())
    }

    /// Enqueue an already built payload (e.g. relayed bytes).
    pub fn enqueue_message(&self, payload: MessagePayload) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::NotAdvertised(self.name.clone()));
        }
        let mut state = self.state.lock();
        self.seq.fetch_add(1, Ordering::Relaxed);
        self.enqueue_locked(&mut state, payload);
        Ok(())
    }

    fn enqueue_locked(&self, state: &mut PubState, payload: MessagePayload) {
        for link in &state.links {
            link.enqueue(payload.clone());
        }
        if self.latch {
            state.latched = Some(payload);
        }
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Attach a subscriber. A latched message, if any, is sent to it first.
    pub fn add_subscriber_link(&self, link: SubscriberLink) {
        if self.is_dropped() {
            link.close("publication dropped");
            return;
        }
        let callbacks = {
            let mut state = self.state.lock();
            if let Some(latched) = &state.latched {
                link.enqueue(latched.clone());
            }
            state.links.push(link.clone());
            state.status_callbacks.clone()
        };
        log::debug!(
            "[pub {}] subscriber {} connected ({})",
            self.name,
            link.destination_caller_id(),
            link.transport_name()
        );
        self.notify_peers(&callbacks, &link, true);
    }

    /// Detach (and close) the link with `id`. Unknown ids are ignored.
    pub fn remove_subscriber_link(&self, id: u64) {
        let (link, callbacks) = {
            let mut state = self.state.lock();
            let pos = match state.links.iter().position(|l| l.id() == id) {
                Some(p) => p,
                None => return,
            };
            (state.links.remove(pos), state.status_callbacks.clone())
        };
        link.close("removed from publication");
        log::debug!(
            "[pub {}] subscriber {} disconnected",
            self.name,
            link.destination_caller_id()
        );
        self.notify_peers(&callbacks, &link, false);
    }

    /// Queue connect/disconnect callbacks from a snapshot (outside the lock).
    fn notify_peers(&self, callbacks: &[(OwnerId, SubscriberStatusCallbacks)], link: &SubscriberLink, connected: bool) {
        for (owner, cbs) in callbacks {
            let cb = if connected {
                cbs.on_connect.clone()
            } else {
                cbs.on_disconnect.clone()
            };
            if let Some(cb) = cb {
                let peer = PeerPublisher {
                    topic: self.name.clone(),
                    link: link.clone(),
                };
                self.queue.add_callback(
                    CallbackEntry::new(*owner, CallbackKind::PeerEvent(Box::new(move || cb(&peer)))),
                    0,
                );
            }
        }
    }

    pub fn add_status_callbacks(&self, owner: OwnerId, callbacks: SubscriberStatusCallbacks) {
        if callbacks.is_empty() {
            return;
        }
        let links = {
            let mut state = self.state.lock();
            state.status_callbacks.push((owner, callbacks.clone()));
            state.links.clone()
        };
        // Subscribers already connected count as new for this handle.
        let snapshot = [(owner, callbacks)];
        for link in &links {
            self.notify_peers(&snapshot, link, true);
        }
    }

    pub fn remove_status_callbacks(&self, owner: OwnerId) {
        self.state.lock().status_callbacks.retain(|(o, _)| *o != owner);
        self.queue.remove_by_id(owner);
    }

    /// Close every link and refuse further publishing.
    pub fn drop_publication(&self) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        let links = {
            let mut state = self.state.lock();
            state.latched = None;
            std::mem::take(&mut state.links)
        };
        for link in links {
            link.close("publication dropped");
        }
        log::debug!("[pub {}] dropped", self.name);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn link_stats(&self) -> Vec<PublicationLinkStats> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| {
                let s = l.stats();
                PublicationLinkStats {
                    id: l.id(),
                    bytes_sent: s.bytes_sent,
                    messages_sent: s.messages_sent,
                    connected: true,
                }
            })
            .collect()
    }

    pub fn link_info(&self) -> Vec<PublicationLinkInfo> {
        self.state
            .lock()
            .links
            .iter()
            .map(|l| PublicationLinkInfo {
                id: l.id(),
                destination: l.destination_caller_id().to_string(),
                transport: l.transport_name(),
                info: l.info(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("name", &self.name)
            .field("datatype", &self.datatype)
            .field("latch", &self.latch)
            .field("subscribers", &self.num_subscribers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgHeader;
    use crate::message::{RosReader, RosWriter};
    use crate::msgs::StringMsg;
    use std::time::Duration;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Stamped {
        header: MsgHeader,
        value: u32,
    }

    impl RosMessage for Stamped {
        fn msg_type() -> String {
            "test_msgs/Stamped".into()
        }
        fn md5sum() -> String {
            "0123456789abcdef0123456789abcdef".into()
        }
        fn has_header() -> bool {
            true
        }
        fn encode(&self, w: &mut RosWriter) {
            self.header.encode(w);
            w.write_u32(self.value);
        }
        fn decode(r: &mut RosReader<'_>) -> Result<Self> {
            Ok(Self {
                header: MsgHeader::decode(r)?,
                value: r.read_u32()?,
            })
        }
        fn header_mut(&mut self) -> Option<&mut MsgHeader> {
            Some(&mut self.header)
        }
    }

    fn publication(latch: bool) -> Arc<Publication> {
        Publication::new(
            "/chatter",
            &StringMsg::msg_type(),
            &StringMsg::md5sum(),
            "",
            10,
            latch,
            false,
            Arc::new(CallbackQueue::new()),
        )
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publication = publication(false);
        publication.publish(StringMsg::new("a")).unwrap();
        publication.publish(StringMsg::new("b")).unwrap();
        assert_eq!(publication.messages_published(), 2);
        assert_eq!(publication.sequence(), 2);
    }

    #[test]
    fn test_publish_after_drop_fails() {
        let publication = publication(true);
        publication.drop_publication();
        assert!(matches!(
            publication.publish(StringMsg::new("x")),
            Err(Error::NotAdvertised(_))
        ));
    }

    #[test]
    fn test_header_sequence_is_stamped() {
        let queue = Arc::new(CallbackQueue::new());
        let publication = Publication::new(
            "/stamped",
            &Stamped::msg_type(),
            &Stamped::md5sum(),
            "",
            10,
            true,
            true,
            queue,
        );
        for v in 0..3 {
            publication.publish(Stamped { value: v, ..Default::default() }).unwrap();
        }
        let latched = publication.state.lock().latched.clone().unwrap();
        let msg = latched.downcast::<Stamped>().unwrap();
        assert_eq!(msg.header.seq, 2);
        assert!(!msg.header.stamp.is_zero());
        assert_eq!(msg.value, 2);
    }

    #[test]
    fn test_status_callbacks_queued() {
        let queue = Arc::new(CallbackQueue::new());
        let publication = Publication::new("/t", "std_msgs/String", "*", "", 1, false, false, queue.clone());
        let connected = Arc::new(Mutex::new(Vec::new()));
        let c = connected.clone();
        publication.add_status_callbacks(
            42,
            SubscriberStatusCallbacks {
                on_connect: Some(Arc::new(move |peer: &PeerPublisher| {
                    c.lock().push(peer.subscriber_name().to_string());
                })),
                on_disconnect: None,
            },
        );
        let sub_link = super::super::subscriber_link::LocalSubscriberLink::new(
            7,
            "/listener",
            std::sync::Weak::new(),
            false,
        );
        publication.add_subscriber_link(SubscriberLink::Local(sub_link));
        assert_eq!(publication.subscriber_names(), vec!["/listener"]);
        queue.call_available(Duration::ZERO);
        assert_eq!(*connected.lock(), vec!["/listener"]);

        publication.remove_subscriber_link(7);
        assert_eq!(publication.num_subscribers(), 0);
    }
}
