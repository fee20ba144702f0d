// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rosnode - ROS1 client runtime
//!
//! A ROS1 node in pure Rust: XML-RPC master/slave API, TCPROS topics and
//! services, a callback queue and actionlib.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rosnode::msgs::StringMsg;
//! use rosnode::{Node, NodeConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let node = Node::new("talker", NodeConfig::default())?;
//!
//!     let chatter = node.advertise::<StringMsg>("chatter", 10, false)?;
//!     let _sub = node.subscribe::<StringMsg, _>("chatter", 10, |msg| {
//!         println!("heard {}", msg.data);
//!     })?;
//!
//!     chatter.publish(StringMsg::new("hello"))?;
//!     node.spin();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                               Node                                  |
//! |   advertise / subscribe / advertise_service / spin / shutdown       |
//! +---------------------------------------------------------------------+
//! |   TopicManager       ServiceManager       Param        actionlib    |
//! |   Publication        ServicePublication   (cached)                  |
//! |   Subscription       ServiceClient                                  |
//! +---------------------------------------------------------------------+
//! |   Master (retrying)  XmlRpcManager (slave API)   CallbackQueue      |
//! +---------------------------------------------------------------------+
//! |   ConnectionManager: TCPROS listener, handshake, framed connections |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Owns every manager; entry point for all handles |
//! | [`Publisher`] | Typed topic publisher, unadvertises on drop |
//! | [`Subscriber`] | Subscription handle, unsubscribes on drop |
//! | [`ServiceServer`] / [`ServiceClient`] | TCPROS services |
//! | [`actionlib::ActionClient`] / [`actionlib::ActionServer`] | Goals with feedback and cancel |
//!
//! Logging goes through the `log` facade; install any logger to see it.

/// Callback queue and spinners.
pub mod callback_queue;
/// Node configuration (environment, builder, validation).
pub mod config;
/// Crate-wide error type.
pub mod error;
/// Master XML-RPC API client.
pub mod master;
/// Message serialization contract.
pub mod message;
/// Built-in message types.
pub mod msgs;
/// Graph resource names.
pub mod names;
/// Node runtime and handles.
pub mod node;
/// Parameter server client with a local cache.
pub mod param;
/// TCPROS services.
pub mod service;
/// TCPROS topics.
pub mod topic;
/// TCPROS connections and handshake headers.
pub mod transport;
/// XML-RPC codec, client and server.
pub mod xmlrpc;
/// Slave API server and XML-RPC client pool.
pub mod xmlrpc_manager;

/// actionlib client and server.
pub mod actionlib;

pub use callback_queue::{AsyncSpinner, CallbackQueue};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use message::{MessageEvent, MsgHeader, RosMessage, RosReader, RosService, RosWriter, Time};
pub use node::{Node, Publisher, ServiceServer, Subscriber, SubscriberOptions};
pub use service::ServiceClient;
