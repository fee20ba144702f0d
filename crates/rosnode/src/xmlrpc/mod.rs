// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal XML-RPC over HTTP/1.1.
//!
//! Only what the ROS master and slave APIs need: blocking calls with
//! keep-alive reuse on the client side, and a thread-per-connection server
//! dispatching into a shared handler table.

mod client;
mod http;
mod server;
mod value;

use std::fmt;
use std::io;

pub use client::XmlRpcClient;
pub use server::{Handler, HandlerTable, XmlRpcServer};
pub use value::{decode_call, decode_response, encode_call, encode_fault, encode_response, Value};

use crate::error::{Error, Result};

/// Fault code returned for unknown methods.
pub const FAULT_METHOD_NOT_FOUND: i32 = -32601;

/// Fault code returned for unparseable requests.
pub const FAULT_PARSE_ERROR: i32 = -32700;

/// XML-RPC failure.
#[derive(Debug)]
pub enum XmlRpcError {
    /// Could not connect, or the socket failed mid-exchange.
    Transport(io::Error),
    /// Bad HTTP framing or non-200 status.
    Http(String),
    /// Body is not a valid XML-RPC document.
    Parse(String),
    /// Server returned a `<fault>`.
    Fault { code: i32, message: String },
}

impl XmlRpcError {
    /// True when the server could not be reached at all (worth retrying).
    pub fn is_transport(&self) -> bool {
        matches!(self, XmlRpcError::Transport(_))
    }
}

impl fmt::Display for XmlRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XmlRpcError::Transport(e) => write!(f, "transport error: {}", e),
            XmlRpcError::Http(msg) => write!(f, "HTTP error: {}", msg),
            XmlRpcError::Parse(msg) => write!(f, "parse error: {}", msg),
            XmlRpcError::Fault { code, message } => write!(f, "fault {}: {}", code, message),
        }
    }
}

impl std::error::Error for XmlRpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XmlRpcError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for XmlRpcError {
    fn from(e: io::Error) -> Self {
        XmlRpcError::Transport(e)
    }
}

/// Split `http://host:port/path` into host and port (port defaults to 80).
pub fn parse_http_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
    parse_host_port(rest, 80).ok_or_else(|| Error::InvalidUri(uri.to_string()))
}

/// Split `rosrpc://host:port` into host and port.
pub fn parse_rosrpc_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("rosrpc://")
        .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
    match parse_host_port(rest, 0) {
        Some((host, port)) if port != 0 => Ok((host, port)),
        _ => Err(Error::InvalidUri(uri.to_string())),
    }
}

fn parse_host_port(rest: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal.
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, tail) = v6.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_uri() {
        assert_eq!(
            parse_http_uri("http://localhost:11311/").unwrap(),
            ("localhost".to_string(), 11311)
        );
        assert_eq!(
            parse_http_uri("http://10.0.0.2:40000").unwrap(),
            ("10.0.0.2".to_string(), 40000)
        );
        assert_eq!(
            parse_http_uri("http://master/").unwrap(),
            ("master".to_string(), 80)
        );
        assert_eq!(
            parse_http_uri("http://[::1]:11311/").unwrap(),
            ("::1".to_string(), 11311)
        );
        assert!(parse_http_uri("localhost:11311").is_err());
        assert!(parse_http_uri("http://host:notaport/").is_err());
        assert!(parse_http_uri("http:///").is_err());
    }

    #[test]
    fn test_parse_rosrpc_uri() {
        assert_eq!(
            parse_rosrpc_uri("rosrpc://robot:45000").unwrap(),
            ("robot".to_string(), 45000)
        );
        assert!(parse_rosrpc_uri("rosrpc://robot").is_err());
        assert!(parse_rosrpc_uri("http://robot:1").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(XmlRpcError::Transport(io::Error::other("refused")).is_transport());
        assert!(!XmlRpcError::Fault {
            code: 1,
            message: "x".into()
        }
        .is_transport());
    }
}
