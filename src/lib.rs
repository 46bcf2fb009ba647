//! # Sockudo-WS Server: WebSocket admission and handshake core
//!
//! Accepts HTTP/1.1 upgrade requests, validates them, runs an optional
//! admission predicate and promotes accepted sockets to WebSocket
//! connections tracked by their server.
//!
//! ## Features
//!
//! - **Strict handshake validation**: malformed upgrades are answered with 400
//! - **Admission control**: synchronous or async `verify_client` predicates, 401 on decline
//! - **Shared listeners**: several servers on one port, routed by request path
//! - **Owned or borrowed listeners**: closing a server never closes a listener it borrowed
//! - **Manual upgrades**: promote sockets read by your own HTTP stack
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_ws_server::prelude::*;
//!
//! let server = WebSocketServer::new(ServerOptions::builder().port(8080).build()?)?;
//! let mut events = server.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     if let ServerEvent::Connection(conn) = event {
//!         tokio::spawn(async move {
//!             while let Some(msg) = conn.recv().await {
//!                 let _ = conn.send(msg);
//!             }
//!         });
//!     }
//! }
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

pub mod admission;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod path_registry;
pub mod registry;
pub mod request;
pub mod server;
pub mod transport;
mod upgrade;

pub use admission::{AdmissionPolicy, BoxError, ClientInfo, Verdict};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Error, HandshakeError, Result};
pub use listener::{HttpListener, RequestHandler};
pub use path_registry::{ListenerId, PathRegistry, UpgradeHandler};
pub use registry::ConnectionRegistry;
pub use request::{Request, read_request};
pub use server::{ListenerOwnership, ServerEvent, WebSocketServer};
pub use transport::{Socket, Transport};
pub use tokio_tungstenite::tungstenite::Message;

/// WebSocket GUID for handshake (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum size of an HTTP request head
pub const MAX_HEADER_SIZE: usize = 8192;

/// Time allowed for a request head to arrive after accept
pub const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum message size (100 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Protocol versions accepted by default
pub const DEFAULT_SUPPORTED_VERSIONS: [u8; 2] = [13, 8];

/// Sub-protocol selection hook
///
/// Receives the protocols proposed by the client, in order, and returns the
/// one to accept (or `None` to accept without a sub-protocol).
pub type ProtocolSelector = dyn Fn(&[String], &Request) -> Option<String> + Send + Sync + 'static;

/// Where a server gets its upgrade requests from
#[derive(Clone)]
pub enum ListenerMode {
    /// Bind a dedicated listener, owned and closed by the server
    Port {
        /// Interface to bind
        host: IpAddr,
        /// Port to bind (0 picks an ephemeral port)
        port: u16,
    },
    /// Attach to an existing listener, which the server never closes
    Listener(HttpListener),
    /// No listener: upgrades arrive through
    /// [`WebSocketServer::handle_upgrade`] only
    NoServer,
}

impl fmt::Debug for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMode::Port { host, port } => {
                write!(f, "Port({})", SocketAddr::new(*host, *port))
            }
            ListenerMode::Listener(l) => write!(f, "Listener({})", l.local_addr()),
            ListenerMode::NoServer => f.write_str("NoServer"),
        }
    }
}

/// Configuration for a WebSocket server
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use sockudo_ws_server::ServerOptions;
///
/// let options = ServerOptions::builder()
///     .port(8080)
///     .path("/chat")
///     .verify_client(|info| info.origin() == Some("https://app.example"))
///     .max_payload(1024 * 1024)
///     .admission_timeout(Duration::from_secs(5))
///     .build()?;
/// ```
#[derive(Clone)]
pub struct ServerOptions {
    mode: ListenerMode,
    /// Request path this server answers on (`None` answers every path)
    pub path: Option<String>,
    /// Admission predicate (default: admit everyone)
    pub admission: AdmissionPolicy,
    /// Sub-protocol selection hook (default: first proposal)
    pub handle_protocols: Option<Arc<ProtocolSelector>>,
    /// Accepted `Sec-WebSocket-Version` values (default: 13 and 8)
    pub supported_versions: Vec<u8>,
    /// Maximum message and frame size (default: 100 MiB)
    pub max_payload: usize,
    /// Time the admission predicate may take before the client is rejected (default: 10s)
    pub admission_timeout: Duration,
    /// Time a closing handshake may take before the socket is dropped (default: 30s)
    pub close_timeout: Duration,
}

impl ServerOptions {
    /// Create a new options builder
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::new()
    }

    /// Listener mode
    pub fn mode(&self) -> &ListenerMode {
        &self.mode
    }

    /// Configured port, for servers that bind their own listener
    pub fn port(&self) -> Option<u16> {
        match self.mode {
            ListenerMode::Port { port, .. } => Some(port),
            _ => None,
        }
    }

    /// Configured bind interface, for servers that bind their own listener
    pub fn host(&self) -> Option<IpAddr> {
        match self.mode {
            ListenerMode::Port { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Returns true if the server has no listener
    pub fn no_server(&self) -> bool {
        matches!(self.mode, ListenerMode::NoServer)
    }

    /// Pick the sub-protocol to accept from a client's proposals
    pub fn select_protocol(&self, proposed: &[String], request: &Request) -> Option<String> {
        match &self.handle_protocols {
            Some(select) => select(proposed, request),
            None => proposed.first().cloned(),
        }
    }

    /// Framing limits handed to the WebSocket codec
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_payload);
        config.max_frame_size = Some(self.max_payload);
        config
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("mode", &self.mode)
            .field("path", &self.path)
            .field("admission", &self.admission)
            .field("handle_protocols", &self.handle_protocols.is_some())
            .field("supported_versions", &self.supported_versions)
            .field("max_payload", &self.max_payload)
            .field("admission_timeout", &self.admission_timeout)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

/// Builder for server options
///
/// Exactly one of [`port`](Self::port), [`listener`](Self::listener) or
/// [`no_server`](Self::no_server) must be set.
#[derive(Clone)]
pub struct ServerOptionsBuilder {
    port: Option<u16>,
    host: Option<IpAddr>,
    listener: Option<HttpListener>,
    no_server: bool,
    path: Option<String>,
    admission: AdmissionPolicy,
    handle_protocols: Option<Arc<ProtocolSelector>>,
    supported_versions: Vec<u8>,
    max_payload: usize,
    admission_timeout: Duration,
    close_timeout: Duration,
}

impl ServerOptionsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            port: None,
            host: None,
            listener: None,
            no_server: false,
            path: None,
            admission: AdmissionPolicy::allow_all(),
            handle_protocols: None,
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            admission_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(30),
        }
    }

    /// Bind a dedicated listener on this port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Interface for the dedicated listener (default: all IPv4 interfaces)
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    /// Attach to an existing listener
    pub fn listener(mut self, listener: HttpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run without a listener
    pub fn no_server(mut self) -> Self {
        self.no_server = true;
        self
    }

    /// Only answer upgrades for this path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Admit clients only if `verify` returns true
    pub fn verify_client<F>(mut self, verify: F) -> Self
    where
        F: Fn(&ClientInfo) -> bool + Send + Sync + 'static,
    {
        self.admission = AdmissionPolicy::from_fn(verify);
        self
    }

    /// Admit clients only if the future returned by `verify` resolves to `Ok(true)`
    pub fn verify_client_async<F, Fut>(mut self, verify: F) -> Self
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<bool, BoxError>> + Send + 'static,
    {
        self.admission = AdmissionPolicy::from_async(verify);
        self
    }

    /// Use a prepared admission policy
    pub fn admission(mut self, policy: AdmissionPolicy) -> Self {
        self.admission = policy;
        self
    }

    /// Choose the sub-protocol from the client's proposals
    pub fn handle_protocols<F>(mut self, select: F) -> Self
    where
        F: Fn(&[String], &Request) -> Option<String> + Send + Sync + 'static,
    {
        self.handle_protocols = Some(Arc::new(select));
        self
    }

    /// Accepted protocol versions
    pub fn supported_versions(mut self, versions: impl Into<Vec<u8>>) -> Self {
        self.supported_versions = versions.into();
        self
    }

    /// Maximum message and frame size
    pub fn max_payload(mut self, size: usize) -> Self {
        self.max_payload = size;
        self
    }

    /// Time the admission predicate may take
    pub fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Time a closing handshake may take
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Validate and build the options
    pub fn build(self) -> Result<ServerOptions> {
        let modes = [self.port.is_some(), self.listener.is_some(), self.no_server]
            .iter()
            .filter(|set| **set)
            .count();
        if modes != 1 {
            return Err(Error::Configuration(
                "exactly one of port, listener or no_server must be specified".into(),
            ));
        }
        if self.host.is_some() && self.port.is_none() {
            return Err(Error::Configuration("host requires port".into()));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(Error::Configuration(format!(
                    "path {path:?} must start with '/'"
                )));
            }
        }
        if self.supported_versions.is_empty() {
            return Err(Error::Configuration(
                "at least one protocol version must be supported".into(),
            ));
        }

        let mode = match (self.port, self.listener) {
            (Some(port), _) => ListenerMode::Port {
                host: self.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                port,
            },
            (None, Some(listener)) => ListenerMode::Listener(listener),
            (None, None) => ListenerMode::NoServer,
        };

        Ok(ServerOptions {
            mode,
            path: self.path,
            admission: self.admission,
            handle_protocols: self.handle_protocols,
            supported_versions: self.supported_versions,
            max_payload: self.max_payload,
            admission_timeout: self.admission_timeout,
            close_timeout: self.close_timeout,
        })
    }
}

impl Default for ServerOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionState};
    pub use crate::error::{Error, Result};
    pub use crate::listener::HttpListener;
    pub use crate::request::{Request, read_request};
    pub use crate::server::{ServerEvent, WebSocketServer};
    pub use crate::transport::Socket;
    pub use crate::{Message, ServerOptions};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::builder().no_server().build().unwrap();
        assert!(options.no_server());
        assert_eq!(options.port(), None);
        assert_eq!(options.path, None);
        assert_eq!(options.supported_versions, vec![13, 8]);
        assert_eq!(options.max_payload, 100 * 1024 * 1024);
        assert_eq!(options.admission_timeout, Duration::from_secs(10));
        assert_eq!(options.close_timeout, Duration::from_secs(30));
        assert!(!options.admission.is_configured());
    }

    #[test]
    fn test_exactly_one_mode() {
        assert!(matches!(
            ServerOptions::builder().build(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ServerOptions::builder().port(1).no_server().build(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ServerOptions::builder().host(IpAddr::V4(Ipv4Addr::LOCALHOST)).no_server().build(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_port_mode() {
        let options = ServerOptions::builder()
            .port(8080)
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .build()
            .unwrap();
        assert_eq!(options.port(), Some(8080));
        assert_eq!(options.host(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!options.no_server());
    }

    #[test]
    fn test_invalid_path_and_versions() {
        assert!(ServerOptions::builder().no_server().path("chat").build().is_err());
        assert!(
            ServerOptions::builder()
                .no_server()
                .supported_versions(Vec::new())
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_select_protocol() {
        let (request, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        let proposed = vec!["chat".to_string(), "superchat".to_string()];

        let options = ServerOptions::builder().no_server().build().unwrap();
        assert_eq!(options.select_protocol(&proposed, &request).as_deref(), Some("chat"));
        assert_eq!(options.select_protocol(&[], &request), None);

        let options = ServerOptions::builder()
            .no_server()
            .handle_protocols(|proposed, _| proposed.iter().find(|p| *p == "superchat").cloned())
            .build()
            .unwrap();
        assert_eq!(
            options.select_protocol(&proposed, &request).as_deref(),
            Some("superchat")
        );
    }

    #[test]
    fn test_websocket_config_limits() {
        let options = ServerOptions::builder()
            .no_server()
            .max_payload(1024)
            .build()
            .unwrap();
        let config = options.websocket_config();
        assert_eq!(config.max_message_size, Some(1024));
        assert_eq!(config.max_frame_size, Some(1024));
    }
}
