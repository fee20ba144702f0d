// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Services over TCPROS.
//!
//! Server side: [`ServiceManager`] owns one [`ServicePublication`] per
//! advertised service and serves each inbound client on its connection
//! thread. Client side: [`ServiceClient`] resolves the service through the
//! master and talks to it over a [`ServiceServerLink`].

mod service_client;
mod service_client_link;
mod service_manager;
mod service_publication;
mod service_server_link;

pub use service_client::{wait_for_service, RawServiceClient, ServiceClient};
pub use service_client_link::ServiceClientLink;
pub use service_manager::{AdvertiseServiceOptions, ServiceManager};
pub use service_publication::{ServiceHandler, ServicePublication, ServiceStats};
pub use service_server_link::ServiceServerLink;
