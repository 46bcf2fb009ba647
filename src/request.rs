//! HTTP request head parsing
//!
//! The listener reads one request head per TCP connection and turns it into
//! a [`Request`]. Requests carrying an `Upgrade` header are routed to a
//! WebSocket server; the rest go to the listener's ordinary request handler.
//!
//! For manual upgrade handling, [`read_request`] parses a head from a socket
//! the caller already owns and returns whatever bytes arrived after it.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use tokio::io::AsyncReadExt;

use crate::MAX_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::transport::Socket;

/// Maximum number of headers accepted in a request head
const MAX_HEADERS: usize = 64;

/// A parsed HTTP request head
///
/// Header access is case-insensitive. The secure flag and peer address come
/// from the socket the request arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    secure: bool,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    /// Build a request from its parts
    pub fn new(method: Method, target: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers,
            secure: false,
            peer_addr: None,
        }
    }

    /// Parse a request head
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete head,
    /// otherwise the request and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_SIZE {
                    return Err(Error::InvalidHttp("request too large"));
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(Error::InvalidHttp("too many headers"));
            }
            Err(_) => return Err(Error::InvalidHttp("failed to parse HTTP request")),
        };

        if len > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("request too large"));
        }

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or(Error::InvalidHttp("invalid method"))?;
        let target = req.path.ok_or(Error::InvalidHttp("missing request target"))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| Error::InvalidHttp("invalid header name"))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| Error::InvalidHttp("invalid header value"))?;
            map.append(name, value);
        }

        Ok(Some((
            Request {
                method,
                target: target.to_string(),
                version,
                headers: map,
                secure: false,
                peer_addr: None,
            },
            len,
        )))
    }

    /// Attach transport metadata from the socket the request arrived on
    pub(crate) fn with_transport(mut self, socket: &Socket) -> Self {
        self.secure = socket.is_secure();
        self.peer_addr = socket.peer_addr();
        self
    }

    /// Request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Raw request target, including any query string
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Path component of the request target
    pub fn path(&self) -> &str {
        request_path(&self.target)
    }

    /// Query string, without the leading `?`
    pub fn query(&self) -> Option<&str> {
        let rest = self.target.split('#').next().unwrap_or_default();
        rest.split_once('?').map(|(_, q)| q)
    }

    /// HTTP version of the request line
    pub fn version(&self) -> Version {
        self.version
    }

    /// All request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header as a string, if present and valid UTF-8
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the request arrived over an encrypted transport
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Remote address of the peer, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns true if the request asks for a protocol upgrade
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key(header::UPGRADE)
    }

    /// Origin of the page that opened the connection
    ///
    /// Version 8 clients send `Sec-WebSocket-Origin` instead of `Origin`.
    pub fn origin(&self) -> Option<&str> {
        self.header(header::ORIGIN)
            .or_else(|| self.header("sec-websocket-origin"))
            .filter(|o| !o.is_empty())
    }
}

/// Reduce a request target to its path component
///
/// Handles origin-form (`/a?b`) and absolute-form (`http://host/a?b`)
/// targets. Query strings and fragments are dropped.
pub fn request_path(target: &str) -> &str {
    let target = target.split(['?', '#']).next().unwrap_or_default();

    let path = match target.find("://") {
        Some(scheme_end) => {
            let after = &target[scheme_end + 3..];
            match after.find('/') {
                Some(i) => &after[i..],
                None => "/",
            }
        }
        None => target,
    };

    if path.is_empty() { "/" } else { path }
}

/// Read a request head from a socket
///
/// Returns the parsed request (with the socket's transport metadata) and the
/// bytes that followed the head, which belong to the upgraded protocol.
pub async fn read_request(socket: &mut Socket) -> Result<(Request, Bytes)> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let n = socket.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        if let Some((req, consumed)) = Request::parse(&buf)? {
            let head = buf.split_off(consumed).freeze();
            return Ok((req.with_transport(socket), head));
        }
    }
}
