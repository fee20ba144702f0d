// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node runtime configuration.
//!
//! # Environment Variables
//!
//! - `ROS_MASTER_URI`: master XML-RPC endpoint (default: `http://localhost:11311/`)
//! - `ROS_HOSTNAME`: host name advertised to peers (takes precedence over `ROS_IP`)
//! - `ROS_IP`: IP address advertised to peers
//! - `ROS_NAMESPACE`: namespace for relative names (default: `/`)
//!
//! When neither `ROS_HOSTNAME` nor `ROS_IP` is set, the first non-loopback
//! local address is advertised, falling back to `localhost`.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::xmlrpc::parse_http_uri;

/// Default master URI.
pub const DEFAULT_MASTER_URI: &str = "http://localhost:11311/";

/// Hard upper bound for a single TCPROS block.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_000_000_000;

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Master XML-RPC URI.
    pub master_uri: String,

    /// Host name or IP advertised in XML-RPC and TCPROS URIs.
    pub advertise_host: String,

    /// Local address the servers bind to.
    pub bind_ip: IpAddr,

    /// XML-RPC server port (0 = ephemeral).
    pub xmlrpc_port: u16,

    /// TCPROS server port (0 = ephemeral).
    pub tcpros_port: u16,

    /// Namespace for relative names.
    pub namespace: String,

    /// How long master calls keep retrying on connection failures.
    pub master_retry_timeout: Duration,

    /// Delay between master retries.
    pub master_retry_interval: Duration,

    /// Read/write timeout for a single XML-RPC exchange.
    pub xmlrpc_timeout: Duration,

    /// TCP connect timeout for TCPROS and XML-RPC.
    pub connect_timeout: Duration,

    /// Largest block accepted on a TCPROS connection.
    pub max_message_size: usize,

    /// Action servers: status array publish rate (Hz).
    pub action_status_frequency: f64,

    /// Action servers: how long terminal goals stay in the status array.
    pub action_status_list_timeout: Duration,

    /// Action clients: how long a cancel may stay unacknowledged before the
    /// goal is considered lost.
    pub action_preempt_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master_uri: std::env::var("ROS_MASTER_URI")
                .unwrap_or_else(|_| DEFAULT_MASTER_URI.to_string()),
            advertise_host: default_advertise_host(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            xmlrpc_port: 0,
            tcpros_port: 0,
            namespace: std::env::var("ROS_NAMESPACE").unwrap_or_else(|_| "/".to_string()),
            master_retry_timeout: Duration::from_secs(5),
            master_retry_interval: Duration::from_millis(250),
            xmlrpc_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            action_status_frequency: 5.0,
            action_status_list_timeout: Duration::from_secs(5),
            action_preempt_timeout: Duration::from_millis(3000),
        }
    }
}

fn default_advertise_host() -> String {
    if let Ok(host) = std::env::var("ROS_HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    if let Ok(ip) = std::env::var("ROS_IP") {
        if !ip.is_empty() {
            return ip;
        }
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            log::debug!("[config] no local IP ({}), advertising localhost", e);
            "localhost".to_string()
        }
    }
}

impl NodeConfig {
    /// Configuration for a given master URI.
    pub fn new(master_uri: impl Into<String>) -> Self {
        Self {
            master_uri: master_uri.into(),
            ..Default::default()
        }
    }

    /// Loopback-only configuration (tests and single-host setups).
    pub fn loopback(master_uri: impl Into<String>) -> Self {
        Self {
            master_uri: master_uri.into(),
            advertise_host: "127.0.0.1".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        }
    }

    /// Builder: set advertised host.
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    /// Builder: set namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder: set master retry timeout.
    pub fn with_master_retry_timeout(mut self, timeout: Duration) -> Self {
        self.master_retry_timeout = timeout;
        self
    }

    /// Builder: set XML-RPC exchange timeout.
    pub fn with_xmlrpc_timeout(mut self, timeout: Duration) -> Self {
        self.xmlrpc_timeout = timeout;
        self
    }

    /// Builder: set fixed server ports.
    pub fn with_ports(mut self, xmlrpc_port: u16, tcpros_port: u16) -> Self {
        self.xmlrpc_port = xmlrpc_port;
        self.tcpros_port = tcpros_port;
        self
    }

    /// Builder: set the block size limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        parse_http_uri(&self.master_uri)?;
        if self.advertise_host.is_empty() {
            return Err(Error::Config("advertise_host must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be > 0".into()));
        }
        if self.xmlrpc_timeout.is_zero() {
            return Err(Error::Config("xmlrpc_timeout must be > 0".into()));
        }
        if self.master_retry_interval.is_zero() {
            return Err(Error::Config("master_retry_interval must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be > 0".into()));
        }
        if self.action_status_frequency.is_nan() || self.action_status_frequency <= 0.0 {
            return Err(Error::Config("action_status_frequency must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_config_validates() {
        let config = NodeConfig::loopback("http://127.0.0.1:11311/");
        assert_eq!(config.advertise_host, "127.0.0.1");
        assert_eq!(config.master_retry_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = NodeConfig::loopback("http://127.0.0.1:11311/")
            .with_namespace("/robot")
            .with_master_retry_timeout(Duration::from_secs(1))
            .with_ports(12000, 12001)
            .with_max_message_size(1024);
        assert_eq!(config.namespace, "/robot");
        assert_eq!(config.master_retry_timeout, Duration::from_secs(1));
        assert_eq!(config.xmlrpc_port, 12000);
        assert_eq!(config.tcpros_port, 12001);
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_validation_errors() {
        let bad_uri = NodeConfig::loopback("localhost:11311");
        assert!(bad_uri.validate().is_err());

        let mut zero = NodeConfig::loopback("http://127.0.0.1:11311/");
        zero.max_message_size = 0;
        assert!(zero.validate().is_err());

        let mut no_status = NodeConfig::loopback("http://127.0.0.1:11311/");
        no_status.action_status_frequency = 0.0;
        assert!(no_status.validate().is_err());
    }
}
