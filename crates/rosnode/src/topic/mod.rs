// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topics: publications, subscriptions and the links between them.
//!
//! ```text
//!  Publication --+-- TransportSubscriberLink ==TCPROS==> TransportPublisherLink --+-- Subscription
//!                +-- LocalSubscriberLink -----------------> LocalPublisherLink ---+
//! ```

mod publication;
mod publisher_link;
mod subscriber_link;
mod subscription;
mod topic_manager;

pub use publication::{
    PeerCallback, PeerPublisher, Publication, PublicationLinkInfo, PublicationLinkStats,
    SubscriberStatusCallbacks,
};
pub use publisher_link::{PublisherLink, PublisherLinkStats};
pub use subscriber_link::{SubscriberLink, SubscriberLinkStats};
pub use subscription::{
    Subscription, SubscriptionCallback, SubscriptionContext, SubscriptionLinkInfo,
    SubscriptionLinkStats, WILDCARD,
};
pub use topic_manager::{AdvertiseOptions, SubscribeOptions, TopicManager};
