// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thread-per-connection XML-RPC server.
//!
//! The accept loop polls a non-blocking listener so shutdown never waits on
//! a blocked `accept`. Each connection gets its own thread and may carry
//! several keep-alive requests.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::http::{read_request, write_response};
use super::value::{decode_call, encode_fault, encode_response};
use super::{Value, FAULT_METHOD_NOT_FOUND, FAULT_PARSE_ERROR};

/// Method handler: receives the call parameters, returns the result value.
pub type Handler = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Shared method table. Handlers are cloned out before being invoked, so a
/// concurrent removal never invalidates a call in flight.
pub type HandlerTable = Arc<DashMap<String, Handler>>;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct XmlRpcServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl XmlRpcServer {
    /// Bind and start serving `handlers`.
    pub fn bind(addr: SocketAddr, handlers: HandlerTable) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let accept_thread = {
            let running = running.clone();
            thread::Builder::new()
                .name("rosnode-xmlrpc".into())
                .spawn(move || accept_loop(listener, handlers, running))?
        };

        log::debug!("[xmlrpc] server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting. Connections already open finish their current request.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        log::debug!("[xmlrpc] server on {} stopped", self.local_addr);
    }
}

impl Drop for XmlRpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, handlers: HandlerTable, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let handlers = handlers.clone();
                let running = running.clone();
                let spawned = thread::Builder::new()
                    .name("rosnode-xmlrpc-conn".into())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &handlers, &running) {
                            log::debug!("[xmlrpc] connection from {} ended: {}", peer, e);
                        }
                    });
                if let Err(e) = spawned {
                    log::warn!("[xmlrpc] failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::debug!("[xmlrpc] accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    handlers: &HandlerTable,
    running: &AtomicBool,
) -> Result<(), super::XmlRpcError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    let _ = stream.set_nodelay(true);

    while running.load(Ordering::Acquire) {
        let request = match read_request(&mut stream)? {
            Some(r) => r,
            None => return Ok(()),
        };

        let body = match std::str::from_utf8(&request.body) {
            Ok(text) => dispatch(text, handlers),
            Err(_) => encode_fault(FAULT_PARSE_ERROR, "request body is not UTF-8"),
        };

        let keep_alive = request.head.keep_alive && running.load(Ordering::Acquire);
        write_response(&mut stream, 200, "OK", body.as_bytes(), keep_alive)?;
        if !keep_alive {
            break;
        }
    }
    Ok(())
}

fn dispatch(xml: &str, handlers: &HandlerTable) -> String {
    let (method, params) = match decode_call(xml) {
        Ok(call) => call,
        Err(e) => return encode_fault(FAULT_PARSE_ERROR, &e.to_string()),
    };

    // Clone the handler so the map shard is not held during the call.
    let handler = handlers.get(&method).map(|h| h.value().clone());
    match handler {
        Some(handler) => {
            log::trace!("[xmlrpc] dispatch {}", method);
            encode_response(&handler(&params))
        }
        None => {
            log::debug!("[xmlrpc] unknown method {}", method);
            encode_fault(FAULT_METHOD_NOT_FOUND, &format!("unknown method: {}", method))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmlrpc::{XmlRpcClient, XmlRpcError};

    fn start(handlers: HandlerTable) -> XmlRpcServer {
        XmlRpcServer::bind("127.0.0.1:0".parse().unwrap(), handlers).unwrap()
    }

    fn client_for(server: &XmlRpcServer) -> XmlRpcClient {
        XmlRpcClient::new(
            "127.0.0.1",
            server.port(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_call_and_keep_alive_reuse() {
        let handlers: HandlerTable = Arc::new(DashMap::new());
        let echo: Handler = Arc::new(|params: &[Value]| {
            Value::response(1, "ok", Value::Array(params.to_vec()))
        });
        handlers.insert("echo".into(), echo);
        let server = start(handlers);
        let client = client_for(&server);

        for i in 0..3 {
            let reply = client.call("echo", &[Value::Int(i)]).unwrap();
            assert_eq!(
                reply,
                Value::response(1, "ok", Value::Array(vec![Value::Int(i)]))
            );
        }
        server.shutdown();
    }

    #[test]
    fn test_unknown_method_is_fault() {
        let server = start(Arc::new(DashMap::new()));
        let client = client_for(&server);
        match client.call("nope", &[]) {
            Err(XmlRpcError::Fault { code, .. }) => assert_eq!(code, FAULT_METHOD_NOT_FOUND),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_handler_added_after_start() {
        let handlers: HandlerTable = Arc::new(DashMap::new());
        let server = start(handlers.clone());
        let client = client_for(&server);
        assert!(client.call("late", &[]).is_err());

        let late: Handler = Arc::new(|_: &[Value]| Value::Int(7));
        handlers.insert("late".into(), late);
        assert_eq!(client.call("late", &[]).unwrap(), Value::Int(7));
    }
}
