// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Errors are grouped the same way failures propagate through the runtime:
//! wire/protocol errors are fatal to one connection, negotiation errors abandon
//! one connection attempt, master errors fail one registration, and usage
//! errors are returned straight to the caller.

use std::fmt;
use std::io;

use crate::xmlrpc::XmlRpcError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the node runtime.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Wire / protocol errors
    // ========================================================================
    /// Socket I/O failed.
    Io(io::Error),
    /// Peer rejected the connection or sent a malformed handshake.
    Connection(String),
    /// Declared block length exceeds the hard limit.
    MessageSizeLimit { size: usize, limit: usize },
    /// The operation was cancelled (stream closed by a cancel token).
    Cancelled,
    /// A message could not be decoded.
    Deserialization(String),

    // ========================================================================
    // Negotiation errors
    // ========================================================================
    /// md5sum does not match the pinned / advertised one.
    Md5Mismatch {
        topic: String,
        expected: String,
        actual: String,
    },
    /// Data type does not match the advertised one.
    TypeMismatch {
        topic: String,
        expected: String,
        actual: String,
    },
    /// Peer offered a transport other than TCPROS.
    UnsupportedProtocol(String),

    // ========================================================================
    // Control plane errors
    // ========================================================================
    /// XML-RPC call failed (transport or fault).
    XmlRpc(XmlRpcError),
    /// Master stayed unreachable for the whole retry window.
    MasterUnreachable { method: String, uri: String },
    /// Remote replied with a well-formed envelope and a failure status.
    RpcFailed {
        method: String,
        code: i32,
        message: String,
    },
    /// Remote replied with something other than `[code, message, payload]`.
    InvalidResponse { method: String, reason: String },
    /// Parameter does not exist on the server.
    ParamNotFound(String),

    // ========================================================================
    // Usage errors
    // ========================================================================
    /// Graph resource name failed validation.
    InvalidName(String),
    /// Invalid URI (master, node or service).
    InvalidUri(String),
    /// Configuration rejected by `validate()`.
    Config(String),
    /// Service client already has a call outstanding.
    ConcurrentCall(String),
    /// Service server returned `ok = 0`.
    ServiceFailed { service: String, message: String },
    /// No such service is registered.
    ServiceNotFound(String),
    /// Topic or service is not advertised by this node.
    NotAdvertised(String),
    /// Service is already advertised by this node.
    AlreadyAdvertised(String),
    /// Action goal cannot move to the requested status from its current one.
    InvalidTransition(String),
    /// Operation attempted after the node was shut down.
    Shutdown,
    /// Timed out waiting for a remote condition.
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::MessageSizeLimit { size, limit } => {
                write!(f, "Message size {} exceeds limit {}", size, limit)
            }
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Deserialization(msg) => write!(f, "Deserialization failed: {}", msg),
            Error::Md5Mismatch {
                topic,
                expected,
                actual,
            } => write!(
                f,
                "md5sum mismatch on [{}]: expected {}, got {}",
                topic, expected, actual
            ),
            Error::TypeMismatch {
                topic,
                expected,
                actual,
            } => write!(
                f,
                "Type mismatch on [{}]: expected {}, got {}",
                topic, expected, actual
            ),
            Error::UnsupportedProtocol(p) => write!(f, "Unsupported protocol: {}", p),
            Error::XmlRpc(e) => write!(f, "XML-RPC error: {}", e),
            Error::MasterUnreachable { method, uri } => {
                write!(f, "Master at {} unreachable while calling {}", uri, method)
            }
            Error::RpcFailed {
                method,
                code,
                message,
            } => write!(f, "{} failed with code {}: {}", method, code, message),
            Error::InvalidResponse { method, reason } => {
                write!(f, "Invalid response to {}: {}", method, reason)
            }
            Error::ParamNotFound(key) => write!(f, "Parameter not found: {}", key),
            Error::InvalidName(name) => write!(f, "Invalid name: {}", name),
            Error::InvalidUri(uri) => write!(f, "Invalid URI: {}", uri),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ConcurrentCall(service) => {
                write!(f, "Concurrent call on service client [{}]", service)
            }
            Error::ServiceFailed { service, message } => {
                write!(f, "Service [{}] failed: {}", service, message)
            }
            Error::ServiceNotFound(service) => write!(f, "Service not found: {}", service),
            Error::NotAdvertised(name) => write!(f, "Not advertised: {}", name),
            Error::AlreadyAdvertised(name) => write!(f, "Already advertised: {}", name),
            Error::InvalidTransition(msg) => write!(f, "Invalid goal transition: {}", msg),
            Error::Shutdown => write!(f, "Node is shut down"),
            Error::Timeout(what) => write!(f, "Timed out: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::XmlRpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<XmlRpcError> for Error {
    fn from(e: XmlRpcError) -> Self {
        Error::XmlRpc(e)
    }
}

impl Error {
    /// True for errors that mean "the peer connection is gone".
    pub fn is_connection_drop(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::Cancelled | Error::MessageSizeLimit { .. }
        )
    }
}
