// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side connection to a service server.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::topic::WILDCARD;
use crate::transport::header::{self, keys, HeaderMap};
use crate::transport::{CancelToken, Connection, ConnectionManager};

pub struct ServiceServerLink {
    service: String,
    connection: Arc<Connection>,
    cancel: CancelToken,
    remote: HeaderMap,
}

impl ServiceServerLink {
    /// Connect and complete the handshake. With `probe`, the server only
    /// answers the header.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        connections: &ConnectionManager,
        host: &str,
        port: u16,
        service: &str,
        md5sum: &str,
        caller_id: &str,
        persistent: bool,
        probe: bool,
    ) -> Result<Self> {
        let connection = connections.connect(host, port)?;
        let cancel = CancelToken::new();

        let mut fields = header::from_pairs([
            (keys::CALLERID, caller_id.to_string()),
            (keys::SERVICE, service.to_string()),
            (keys::MD5SUM, md5sum.to_string()),
        ]);
        if persistent {
            fields.insert(keys::PERSISTENT.to_string(), "1".to_string());
        }
        if probe {
            fields.insert(keys::PROBE.to_string(), "1".to_string());
        }

        let remote = match connection
            .write_header(&fields, &cancel)
            .and_then(|_| connection.read_header(&cancel))
        {
            Ok(h) => h,
            Err(e) => {
                connection.drop_connection("service handshake failed");
                return Err(e);
            }
        };

        let remote_md5 = remote.get(keys::MD5SUM).cloned().unwrap_or_default();
        if md5sum != WILDCARD && remote_md5 != WILDCARD && remote_md5 != md5sum {
            connection.drop_connection("service md5sum mismatch");
            return Err(Error::Md5Mismatch {
                topic: service.to_string(),
                expected: md5sum.to_string(),
                actual: remote_md5,
            });
        }

        Ok(Self {
            service: service.to_string(),
            connection,
            cancel,
            remote,
        })
    }

    /// Header the server answered with.
    pub fn remote_header(&self) -> &HeaderMap {
        &self.remote
    }

    pub fn is_dropped(&self) -> bool {
        self.connection.is_dropped()
    }

    /// Send one request and wait for the response.
    pub fn call(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.connection.write_length_prefixed(request, &self.cancel)?;
        let ok = self.connection.read_u8(&self.cancel)?;
        let body = self.connection.read_length_prefixed(&self.cancel)?;
        if ok == 0 {
            return Err(Error::ServiceFailed {
                service: self.service.clone(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    pub fn close(&self, reason: &str) {
        self.cancel.cancel();
        self.connection.drop_connection(reason);
    }
}

impl Drop for ServiceServerLink {
    fn drop(&mut self) {
        self.close("service link released");
    }
}
