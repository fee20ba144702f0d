// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking XML-RPC client with keep-alive connection reuse.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;

use super::http::{read_response, write_request};
use super::value::{decode_response, encode_call};
use super::{Value, XmlRpcError};

/// Client bound to one `host:port`.
///
/// Calls are serialized: one exchange at a time per client. The underlying
/// socket is kept open between calls unless the server asks to close it.
pub struct XmlRpcClient {
    host: String,
    port: u16,
    path: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl XmlRpcClient {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            connect_timeout,
            io_timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn connect(&self) -> Result<TcpStream, XmlRpcError> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(XmlRpcError::Transport(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}:{}", self.host, self.port),
            )
        })))
    }

    fn exchange(&self, stream: &mut TcpStream, body: &[u8]) -> Result<(Value, bool), XmlRpcError> {
        write_request(stream, &self.host, self.port, &self.path, body)?;
        let response = read_response(stream)?;
        if response.head.start != "200" {
            return Err(XmlRpcError::Http(format!(
                "status {} from {}:{}",
                response.head.start, self.host, self.port
            )));
        }
        let text = String::from_utf8(response.body)
            .map_err(|_| XmlRpcError::Parse("response body is not UTF-8".into()))?;
        Ok((decode_response(&text)?, response.head.keep_alive))
    }

    /// Perform one call.
    pub fn call(&self, method: &str, params: &[Value]) -> Result<Value, XmlRpcError> {
        let body = encode_call(method, params);
        let mut slot = self.stream.lock();

        // A pooled socket may have been closed by the server while idle:
        // retry once on a fresh connection before reporting failure.
        if let Some(mut stream) = slot.take() {
            match self.exchange(&mut stream, body.as_bytes()) {
                Ok((value, keep)) => {
                    if keep {
                        *slot = Some(stream);
                    }
                    return Ok(value);
                }
                Err(XmlRpcError::Transport(e)) => {
                    log::debug!(
                        "[xmlrpc] reused connection to {}:{} failed ({}), reconnecting",
                        self.host,
                        self.port,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let mut stream = self.connect()?;
        let (value, keep) = self.exchange(&mut stream, body.as_bytes())?;
        if keep {
            *slot = Some(stream);
        }
        Ok(value)
    }

    /// Drop the pooled socket.
    pub fn close(&self) {
        self.stream.lock().take();
    }
}

impl std::fmt::Debug for XmlRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlRpcClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_is_transport() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = XmlRpcClient::new(
            "127.0.0.1",
            port,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let err = client.call("getPid", &[Value::from("/test")]).unwrap_err();
        assert!(err.is_transport(), "unexpected: {:?}", err);
    }
}
