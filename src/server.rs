//! WebSocket server lifecycle
//!
//! A [`WebSocketServer`] owns a set of live connections and, depending on
//! its [`ListenerMode`], either binds its own [`HttpListener`], attaches to
//! one shared with other servers, or receives upgrades only through
//! [`WebSocketServer::handle_upgrade`].
//!
//! Observers subscribe to [`ServerEvent`]s. Every subscriber receives every
//! event once.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_server::{ServerEvent, ServerOptions, WebSocketServer};
//!
//! let server = WebSocketServer::new(ServerOptions::builder().port(8080).build()?)?;
//! let mut events = server.subscribe();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ServerEvent::Connection(conn) => println!("{} joined", conn.id()),
//!         ServerEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::{BoxFuture, join_all};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::listener::HttpListener;
use crate::path_registry::UpgradeHandler;
use crate::registry::ConnectionRegistry;
use crate::request::Request;
use crate::transport::Socket;
use crate::{ListenerMode, ServerOptions};

/// Notification delivered to server subscribers
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the handshake and was registered
    Connection(Connection),
    /// An upgrade attempt was answered with 400 or 401
    Rejected {
        /// Status sent to the client
        status: StatusCode,
        /// Why the attempt was rejected
        reason: String,
        /// Remote address of the client, if known
        peer_addr: Option<SocketAddr>,
    },
    /// A listener or mid-handshake transport failure
    Error(Arc<Error>),
    /// The server was closed
    Closed,
}

/// How a server relates to its listener
#[derive(Debug)]
pub enum ListenerOwnership {
    /// Bound by the server, closed with it
    Owned(HttpListener),
    /// Supplied by the caller, left running on close
    Borrowed(HttpListener),
    /// No listener at all
    Detached,
}

impl ListenerOwnership {
    /// The listener, if any
    pub fn listener(&self) -> Option<&HttpListener> {
        match self {
            ListenerOwnership::Owned(l) | ListenerOwnership::Borrowed(l) => Some(l),
            ListenerOwnership::Detached => None,
        }
    }

    /// Returns true if closing the server closes the listener
    pub fn is_owned(&self) -> bool {
        matches!(self, ListenerOwnership::Owned(_))
    }
}

/// State shared between the server handle and its listener dispatches
pub(crate) struct Shared {
    pub(crate) options: ServerOptions,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) shutdown: CancellationToken,
    ownership: ListenerOwnership,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>,
    registered: AtomicBool,
    closed: AtomicBool,
    this: Weak<Shared>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ServerEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn as_handler(&self) -> Weak<dyn UpgradeHandler> {
        self.this.clone()
    }

    /// Synchronous part of shutdown
    ///
    /// Returns the connections that were terminated, or nothing if the
    /// server was already closed.
    fn shutdown_now(&self) -> Vec<Connection> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        self.shutdown.cancel();
        let drained = self.registry.close_all();

        if let Some(listener) = self.ownership.listener() {
            if self.registered.swap(false, Ordering::AcqRel) {
                listener
                    .paths()
                    .unregister(self.options.path.as_deref(), &self.as_handler());
            }
            if self.ownership.is_owned() {
                listener.close();
            }
        }

        info!(
            "WebSocket server closed, terminated {} connections",
            drained.len()
        );
        self.emit(ServerEvent::Closed);
        drained
    }
}

impl UpgradeHandler for Shared {
    fn handle_upgrade(
        self: Arc<Self>,
        request: Request,
        socket: Socket,
        head: Bytes,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.promote(request, socket, head).await {
                debug!("Upgrade not completed: {}", e);
            }
        })
    }

    fn listener_error(&self, error: io::Error) {
        self.emit(ServerEvent::Error(Arc::new(Error::Transport(error))));
    }
}

/// A WebSocket server
///
/// Dropping the server terminates its connections, releases its path and
/// closes its listener if it owns one. Use [`close`](Self::close) to also
/// wait for connections to finish.
pub struct WebSocketServer {
    shared: Arc<Shared>,
}

impl WebSocketServer {
    /// Create a server
    ///
    /// Binds a listener for [`ListenerMode::Port`] (which must happen inside
    /// a tokio runtime) and claims the configured path on the listener.
    pub fn new(options: ServerOptions) -> Result<Self> {
        let ownership = match options.mode() {
            ListenerMode::Port { host, port } => {
                ListenerOwnership::Owned(HttpListener::bind(SocketAddr::new(*host, *port))?)
            }
            ListenerMode::Listener(listener) => ListenerOwnership::Borrowed(listener.clone()),
            ListenerMode::NoServer => ListenerOwnership::Detached,
        };

        let shared = Arc::new_cyclic(|this| Shared {
            options,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
            ownership,
            subscribers: Mutex::new(Vec::new()),
            registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            this: this.clone(),
        });

        if let Some(listener) = shared.ownership.listener() {
            listener
                .paths()
                .register(shared.options.path.as_deref(), shared.as_handler())?;
            shared.registered.store(true, Ordering::Release);
            info!(
                "WebSocket server on {} path {:?}",
                listener.local_addr(),
                shared.options.path.as_deref().unwrap_or("*")
            );
        }

        Ok(Self { shared })
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.is_closed() {
            let _ = tx.send(ServerEvent::Closed);
        } else {
            self.shared.subscribers.lock().push(tx);
        }
        rx
    }

    /// Promote a socket the caller has read an upgrade request from
    ///
    /// Runs the same validation and admission as listener dispatches; on
    /// rejection the 400/401 response has already been written when the
    /// error is returned. `head` holds any bytes read past the request head.
    pub async fn handle_upgrade(
        &self,
        request: Request,
        socket: Socket,
        head: Bytes,
    ) -> Result<Connection> {
        self.shared.promote(request, socket, head).await
    }

    /// Close the server and wait for its connections to finish
    ///
    /// Idempotent. Waiting is bounded by the close timeout.
    pub async fn close(&self) {
        let drained = self.shared.shutdown_now();
        let timeout = self.shared.options.close_timeout;

        let closing = join_all(drained.iter().map(|conn| conn.closed()));
        if tokio::time::timeout(timeout, closing).await.is_err() {
            warn!("Connections still closing after {:?}", timeout);
        }

        if let ListenerOwnership::Owned(listener) = &self.shared.ownership {
            let _ = tokio::time::timeout(timeout, listener.closed()).await;
        }
    }

    /// Returns true once the server was closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the live connections
    pub fn clients(&self) -> Vec<Connection> {
        self.shared.registry.snapshot()
    }

    /// Number of live connections
    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The live connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    /// Effective configuration
    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    /// The server's listener and whether it owns it
    pub fn ownership(&self) -> &ListenerOwnership {
        &self.shared.ownership
    }

    /// Address of the listener, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.ownership.listener().map(HttpListener::local_addr)
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.shared.shutdown_now();
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("listener", &self.shared.ownership)
            .field("path", &self.shared.options.path)
            .field("clients", &self.client_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
