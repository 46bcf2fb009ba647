//! HTTP/1.1 listener shared by WebSocket servers
//!
//! An [`HttpListener`] accepts TCP connections, reads one request head from
//! each and routes it:
//!
//! - requests carrying `Upgrade` go to the server registered for their path
//!   (400 if no server claims it)
//! - everything else is answered by the request handler (426 by default)
//!   and the connection is closed
//!
//! A listener either belongs to a single server (created from a port) or is
//! shared by several servers, each claiming a distinct path in its
//! [`PathRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_server::{HttpListener, ServerOptions, WebSocketServer};
//!
//! let listener = HttpListener::bind("127.0.0.1:8080".parse()?)?;
//! let chat = WebSocketServer::new(
//!     ServerOptions::builder().listener(listener.clone()).path("/chat").build()?,
//! )?;
//! let feed = WebSocketServer::new(
//!     ServerOptions::builder().listener(listener.clone()).path("/feed").build()?,
//! )?;
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, UPGRADE};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::REQUEST_HEAD_TIMEOUT;
use crate::error::{Error, Result};
use crate::handshake::build_rejection;
use crate::path_registry::{ListenerId, PathRegistry};
use crate::request::{Request, read_request};
use crate::transport::Socket;

/// Pause after a failed `accept` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listen backlog for sockets bound by [`HttpListener::bind`]
const BACKLOG: i32 = 1024;

/// Handler for requests that are not upgrades
pub type RequestHandler = dyn Fn(&Request) -> http::Response<Bytes> + Send + Sync + 'static;

struct ListenerInner {
    id: ListenerId,
    local_addr: SocketAddr,
    paths: PathRegistry,
    handler: RwLock<Option<Arc<RequestHandler>>>,
    #[cfg(feature = "tls")]
    tls: RwLock<Option<tokio_rustls::TlsAcceptor>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

/// Cancels the accept loop once the last handle is gone
struct CloseOnDrop(CancellationToken);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Handle to a running HTTP listener
///
/// Cloning is cheap; all clones refer to the same socket. The listener stops
/// on [`close`](Self::close) or when the last handle is dropped.
#[derive(Clone)]
pub struct HttpListener {
    inner: Arc<ListenerInner>,
    _guard: Arc<CloseOnDrop>,
}

impl HttpListener {
    /// Bind a new listener and start accepting
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        ensure_runtime()?;

        let socket =
            socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        Self::from_tcp(listener)
    }

    /// Start accepting on an already bound listener
    pub fn from_tcp(listener: TcpListener) -> Result<Self> {
        ensure_runtime()?;

        let local_addr = listener.local_addr()?;
        let id = ListenerId::next();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ListenerInner {
            id,
            local_addr,
            paths: PathRegistry::new(id),
            handler: RwLock::new(None),
            #[cfg(feature = "tls")]
            tls: RwLock::new(None),
            shutdown: shutdown.clone(),
            stopped: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(inner.clone(), listener));
        info!("{} listening on {}", id, local_addr);

        Ok(Self {
            inner,
            _guard: Arc::new(CloseOnDrop(shutdown)),
        })
    }

    /// Terminate TLS on accepted connections
    ///
    /// Connections accepted afterwards report `secure = true`.
    #[cfg(feature = "tls")]
    pub fn with_tls(self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        *self.inner.tls.write() = Some(acceptor);
        self
    }

    /// Answer ordinary (non-upgrade) requests with `handler`
    pub fn with_request_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&Request) -> http::Response<Bytes> + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
        self
    }

    /// Identity of this listener
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Paths claimed by servers on this listener
    pub fn paths(&self) -> &PathRegistry {
        &self.inner.paths
    }

    /// Stop accepting new connections
    ///
    /// Connections that were already accepted are unaffected.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!("{} closing", self.inner.id);
            self.inner.shutdown.cancel();
        }
    }

    /// Returns true once [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until the listening socket has been released
    pub async fn closed(&self) {
        self.inner.stopped.cancelled().await;
    }
}

impl fmt::Debug for HttpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpListener")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("paths", &self.inner.paths)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn ensure_runtime() -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| Error::Configuration("listener must be created inside a tokio runtime".into()))
}

async fn accept_loop(inner: Arc<ListenerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.serve(tcp, addr).await });
                }
                Err(e) => {
                    warn!("{} accept failed: {}", inner.id, e);
                    inner.paths.notify_error(&e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    inner.stopped.cancel();
    info!("{} stopped", inner.id);
}

impl ListenerInner {
    async fn serve(&self, tcp: TcpStream, addr: SocketAddr) {
        let _ = tcp.set_nodelay(true);

        let Some(mut socket) = self.wrap(tcp, addr).await else {
            return;
        };

        let (request, head) =
            match tokio::time::timeout(REQUEST_HEAD_TIMEOUT, read_request(&mut socket)).await {
                Ok(Ok(parsed)) => parsed,
                Ok(Err(Error::InvalidHttp(reason))) => {
                    debug!("Malformed request from {}: {}", addr, reason);
                    let _ = socket
                        .respond_and_close(&build_rejection(StatusCode::BAD_REQUEST, &[]))
                        .await;
                    return;
                }
                Ok(Err(e)) => {
                    debug!("Failed to read request from {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("Request head from {} timed out", addr);
                    return;
                }
            };

        if request.is_upgrade() {
            match self.paths.resolve(request.target()) {
                Some(handler) => handler.handle_upgrade(request, socket, head).await,
                None => {
                    debug!("No server for upgrade path {}", request.path());
                    let _ = socket
                        .respond_and_close(&build_rejection(StatusCode::BAD_REQUEST, &[]))
                        .await;
                }
            }
            return;
        }

        let handler = self.handler.read().clone();
        let response = match handler {
            Some(handler) => handler(&request),
            None => upgrade_required(),
        };
        let _ = socket.respond_and_close(&encode_response(response)).await;
    }

    #[cfg(feature = "tls")]
    async fn wrap(&self, tcp: TcpStream, addr: SocketAddr) -> Option<Socket> {
        let acceptor = self.tls.read().clone();
        match acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(stream) => Some(Socket::new(stream)),
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", addr, e);
                    None
                }
            },
            None => Some(Socket::new(tcp)),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap(&self, tcp: TcpStream, _addr: SocketAddr) -> Option<Socket> {
        Some(Socket::new(tcp))
    }
}

/// Default answer to plain HTTP requests
fn upgrade_required() -> http::Response<Bytes> {
    let mut response = http::Response::new(Bytes::from_static(b"Upgrade Required"));
    *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
    response
        .headers_mut()
        .insert(UPGRADE, http::HeaderValue::from_static("websocket"));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("text/plain"));
    response
}

/// Serialize a response for a connection that closes after it
fn encode_response(response: http::Response<Bytes>) -> Bytes {
    let (parts, body) = response.into_parts();
    let mut buf = BytesMut::with_capacity(128 + body.len());

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(parts.status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(parts.status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in parts.headers.iter() {
        if name == CONNECTION || name == CONTENT_LENGTH {
            continue;
        }
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(&body);
    buf.freeze()
}
