// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP/1.x framing for XML-RPC (head parsing via `httparse`).

use std::io::{self, Read, Write};

use super::XmlRpcError;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;
const MAX_HEADERS: usize = 32;
const READ_CHUNK: usize = 4096;

/// Parsed request or response head.
#[derive(Debug, Default)]
pub(super) struct Head {
    /// Method (requests) or status code (responses).
    pub start: String,
    /// Request path, empty for responses.
    pub path: String,
    pub content_length: Option<usize>,
    pub keep_alive: bool,
}

/// One framed HTTP message.
#[derive(Debug)]
pub(super) struct Message {
    pub head: Head,
    pub body: Vec<u8>,
}

fn keep_alive(version: Option<u8>, headers: &[httparse::Header<'_>]) -> bool {
    let connection = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("connection"))
        .map(|h| String::from_utf8_lossy(h.value).to_ascii_lowercase());
    match (version, connection.as_deref()) {
        (_, Some("close")) => false,
        (_, Some("keep-alive")) => true,
        (Some(1), _) => true,
        _ => false,
    }
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<Option<usize>, String> {
    match headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        Some(h) => std::str::from_utf8(h.value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| "invalid Content-Length".to_string()),
        None => Ok(None),
    }
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, Head)>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf).map_err(|e| e.to_string())? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(n) => Ok(Some((
            n,
            Head {
                start: req.method.unwrap_or_default().to_string(),
                path: req.path.unwrap_or("/").to_string(),
                content_length: content_length(req.headers)?,
                keep_alive: keep_alive(req.version, req.headers),
            },
        ))),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(usize, Head)>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf).map_err(|e| e.to_string())? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(n) => Ok(Some((
            n,
            Head {
                start: resp.code.unwrap_or_default().to_string(),
                path: String::new(),
                content_length: content_length(resp.headers)?,
                keep_alive: keep_alive(resp.version, resp.headers),
            },
        ))),
    }
}

/// Read one message. `Ok(None)` means the peer closed before sending anything.
fn read_message<R, F>(
    reader: &mut R,
    parse_head: F,
    body_until_eof: bool,
) -> Result<Option<Message>, XmlRpcError>
where
    R: Read,
    F: Fn(&[u8]) -> Result<Option<(usize, Head)>, String>,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    let (head_len, mut head) = loop {
        if let Some(parsed) = parse_head(&buf).map_err(XmlRpcError::Http)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(XmlRpcError::Http("HTTP head too large".into()));
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(XmlRpcError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside HTTP head",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut body = buf.split_off(head_len);
    match head.content_length {
        Some(len) => {
            if len > MAX_BODY_SIZE {
                return Err(XmlRpcError::Http(format!("body of {} bytes too large", len)));
            }
            if body.len() < len {
                let already = body.len();
                body.resize(len, 0);
                reader.read_exact(&mut body[already..])?;
            }
            body.truncate(len);
        }
        None if body_until_eof => {
            Read::take(&mut *reader, MAX_BODY_SIZE as u64).read_to_end(&mut body)?;
            head.keep_alive = false;
        }
        None => {}
    }

    Ok(Some(Message { head, body }))
}

pub(super) fn read_request<R: Read>(reader: &mut R) -> Result<Option<Message>, XmlRpcError> {
    read_message(reader, parse_request_head, false)
}

pub(super) fn read_response<R: Read>(reader: &mut R) -> Result<Message, XmlRpcError> {
    read_message(reader, parse_response_head, true)?.ok_or_else(|| {
        XmlRpcError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        ))
    })
}

pub(super) fn write_request<W: Write>(
    writer: &mut W,
    host: &str,
    port: u16,
    path: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "POST {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: rosnode\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
        path,
        host,
        port,
        body.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    writer.write_all(&out)?;
    writer.flush()
}

pub(super) fn write_response<W: Write>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &[u8],
    keep_alive: bool,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nServer: rosnode\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        reason,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" }
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    writer.write_all(&out)?;
    writer.flush()
}
