// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCPROS transport: header codec, connections and the inbound listener.

mod connection;
mod connection_manager;
pub mod header;

pub use connection::{CancelToken, Connection, ConnectionStats};
pub(crate) use connection_manager::reject;
pub use connection_manager::ConnectionManager;
pub use header::HeaderMap;
