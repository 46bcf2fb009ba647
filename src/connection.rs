//! Accepted client connections
//!
//! A [`Connection`] is a cheap, clonable handle to a promoted client. The
//! framed stream itself lives in a driver task spawned when the connection
//! is registered; the handle talks to it through channels:
//!
//! - outgoing messages and close requests go through a command queue
//! - incoming text/binary messages are buffered until [`Connection::recv`];
//!   once [`INCOMING_QUEUE_CAPACITY`] messages are waiting the driver stops
//!   reading the socket
//! - [`Connection::terminate`] cancels the driver and drops the socket
//!
//! When the driver stops (peer close, error, terminate) it removes the
//! connection from its server's registry and only then marks it closed, so
//! code woken by [`Connection::closed`] already sees the updated count.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;
use crate::request::Request;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Incoming messages buffered per connection before reads pause
pub const INCOMING_QUEUE_CAPACITY: usize = 64;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake completed, messages flow both ways
    Open = 0,
    /// A close frame was sent or received
    Closing = 1,
    /// The transport is gone
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

enum Command {
    Send(Message),
    Close(Option<CloseFrame<'static>>),
}

struct Inner {
    id: ConnectionId,
    protocol: Option<String>,
    protocol_version: u8,
    request: Arc<Request>,
    state: AtomicU8,
    commands: mpsc::UnboundedSender<Command>,
    incoming: Mutex<mpsc::Receiver<Message>>,
    terminate: CancellationToken,
    closed: watch::Receiver<bool>,
}

/// Handle to an accepted WebSocket client
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an upgraded stream
    ///
    /// The returned driver must be spawned for messages to flow.
    pub(crate) fn new<S>(
        ws: WebSocketStream<S>,
        request: Arc<Request>,
        protocol: Option<String>,
        protocol_version: u8,
        close_timeout: Duration,
    ) -> (Self, Driver<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: ConnectionId::next(),
            protocol,
            protocol_version,
            request,
            state: AtomicU8::new(ConnectionState::Open as u8),
            commands: command_tx,
            incoming: Mutex::new(incoming_rx),
            terminate: CancellationToken::new(),
            closed: closed_rx,
        });

        let driver = Driver {
            ws,
            inner: inner.clone(),
            commands: command_rx,
            incoming: incoming_tx,
            closed: closed_tx,
            close_timeout,
        };

        (Self { inner }, driver)
    }

    /// Unique identifier of this connection
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Negotiated sub-protocol, if any
    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    /// Protocol version the client declared (13, or 8 for legacy clients)
    pub fn protocol_version(&self) -> u8 {
        self.inner.protocol_version
    }

    /// The request that opened this connection
    pub fn upgrade_request(&self) -> &Request {
        &self.inner.request
    }

    /// Remote address of the peer, if known
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.request.peer_addr()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns true once the transport is gone
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Queue a message for sending
    pub fn send(&self, msg: impl Into<Message>) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .commands
            .send(Command::Send(msg.into()))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queue a text message
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text.into()))
    }

    /// Queue a binary message
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Message::binary(data.into()))
    }

    /// Receive the next text or binary message
    ///
    /// Returns `None` once the connection is closed and every buffered
    /// message has been read.
    pub async fn recv(&self) -> Option<Message> {
        self.inner.incoming.lock().await.recv().await
    }

    /// Start the closing handshake
    ///
    /// The socket is dropped once the peer answers, or after the server's
    /// close timeout.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into().into(),
        };
        self.inner
            .commands
            .send(Command::Close(Some(frame)))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Drop the transport immediately, without a closing handshake
    pub fn terminate(&self) {
        self.inner.terminate.cancel();
    }

    /// Wait until the connection is closed and out of its registry
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.clone();
        // A dropped sender means the driver never ran
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("protocol_version", &self.inner.protocol_version)
            .field("state", &self.state())
            .finish()
    }
}

/// Task that owns the framed stream of one connection
pub(crate) struct Driver<S> {
    ws: WebSocketStream<S>,
    inner: Arc<Inner>,
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
    close_timeout: Duration,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the driver; on exit it removes the connection from `registry`
    pub(crate) fn spawn(self, registry: Weak<ConnectionRegistry>) -> JoinHandle<()> {
        tokio::spawn(self.run(registry))
    }

    async fn run(mut self, registry: Weak<ConnectionRegistry>) {
        let conn = Connection {
            inner: self.inner.clone(),
        };
        let mut close_deadline: Option<Instant> = None;
        // A message read while the incoming queue was full
        let mut pending: Option<Message> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.inner.terminate.cancelled() => {
                    debug!("Connection {} terminated", conn.id());
                    break;
                }

                _ = wait_deadline(close_deadline) => {
                    debug!("Connection {} close handshake timed out", conn.id());
                    break;
                }

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        let sent = tokio::select! {
                            biased;
                            _ = self.inner.terminate.cancelled() => {
                                debug!("Connection {} terminated while sending", conn.id());
                                break;
                            }
                            sent = self.ws.send(msg) => sent,
                        };
                        if let Err(e) = sent {
                            debug!("Connection {} send failed: {}", conn.id(), e);
                            break;
                        }
                    }
                    Some(Command::Close(frame)) => {
                        conn.set_state(ConnectionState::Closing);
                        let deadline = Instant::now() + self.close_timeout;
                        let closed = tokio::select! {
                            biased;
                            _ = self.inner.terminate.cancelled() => {
                                debug!("Connection {} terminated while closing", conn.id());
                                break;
                            }
                            _ = tokio::time::sleep_until(deadline) => {
                                debug!("Connection {} close frame could not be written", conn.id());
                                break;
                            }
                            closed = self.ws.close(frame) => closed,
                        };
                        if let Err(e) = closed {
                            debug!("Connection {} close failed: {}", conn.id(), e);
                            break;
                        }
                        close_deadline = Some(deadline);
                    }
                    None => break,
                },

                permit = self.incoming.reserve(), if pending.is_some() => {
                    if let (Ok(permit), Some(msg)) = (permit, pending.take()) {
                        permit.send(msg);
                    }
                }

                msg = self.ws.next(), if pending.is_none() => match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        if let Err(TrySendError::Full(msg)) = self.incoming.try_send(msg) {
                            pending = Some(msg);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        // The codec answers the close frame; keep reading until EOF
                        conn.set_state(ConnectionState::Closing);
                        close_deadline.get_or_insert_with(|| Instant::now() + self.close_timeout);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Connection {} read failed: {}", conn.id(), e);
                        break;
                    }
                    None => break,
                },
            }
        }

        // Closes the socket
        drop(self.ws);

        if let Some(registry) = registry.upgrade() {
            registry.remove(conn.id());
        }
        conn.set_state(ConnectionState::Closed);
        let _ = self.closed.send(true);
        debug!("Connection {} closed", conn.id());
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    pub(crate) fn request(raw: &str) -> Arc<Request> {
        Arc::new(Request::parse(raw.as_bytes()).unwrap().unwrap().0)
    }

    /// A server-side connection wired to an in-memory client
    pub(crate) async fn pair() -> (
        Connection,
        Driver<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        pair_with_buffer(64 * 1024).await
    }

    /// Like [`pair`], with `buffer` bytes of transport buffering each way
    pub(crate) async fn pair_with_buffer(
        buffer: usize,
    ) -> (
        Connection,
        Driver<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (server, client) = tokio::io::duplex(buffer);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let (conn, driver) = Connection::new(
            server,
            request("GET /chat HTTP/1.1\r\nHost: localhost\r\n\r\n"),
            Some("chat".to_string()),
            13,
            Duration::from_secs(1),
        );
        (conn, driver, client)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{pair, pair_with_buffer};
    use super::*;

    #[tokio::test]
    async fn test_metadata() {
        let (conn, _driver, _client) = pair().await;
        assert_eq!(conn.protocol(), Some("chat"));
        assert_eq!(conn.protocol_version(), 13);
        assert_eq!(conn.upgrade_request().path(), "/chat");
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.clone(), conn);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _da, _ca) = pair().await;
        let (b, _db, _cb) = pair().await;
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (conn, driver, mut client) = pair().await;
        driver.spawn(Weak::new());

        conn.send_text("hello!").unwrap();
        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::text("hello!"));

        client.send(Message::binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(conn.recv().await, Some(Message::binary(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_peer_close() {
        let (conn, driver, mut client) = pair().await;
        driver.spawn(Weak::new());

        client.close(None).await.unwrap();
        conn.closed().await;
        assert!(conn.is_closed());
        assert!(conn.send_text("late").is_err());
        assert_eq!(conn.recv().await, None);
    }

    #[tokio::test]
    async fn test_terminate() {
        let (conn, driver, mut client) = pair().await;
        let handle = driver.spawn(Weak::new());

        conn.terminate();
        conn.closed().await;
        handle.await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        // The peer sees the socket go away without a close frame
        assert!(matches!(client.next().await, None | Some(Err(_))));
    }

    #[tokio::test]
    async fn test_graceful_close() {
        let (conn, driver, mut client) = pair().await;
        driver.spawn(Weak::new());

        conn.close(1000, "bye").unwrap();
        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        // Let the client codec answer the close
        while client.next().await.is_some() {}
        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_times_out_into_terminate() {
        let (conn, driver, client) = pair().await;
        driver.spawn(Weak::new());

        conn.close(1001, "going away").unwrap();
        // The client never reads, so no close reply arrives
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .expect("close timeout should terminate the connection");
        drop(client);
    }

    #[tokio::test]
    async fn test_terminate_while_send_is_blocked() {
        let (conn, driver, _client) = pair_with_buffer(1024).await;
        let registry = Arc::new(ConnectionRegistry::new());
        registry.add(conn.clone());
        driver.spawn(Arc::downgrade(&registry));

        // The client never reads, so this write cannot complete
        conn.send_binary(vec![0u8; 1024 * 1024]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        conn.terminate();
        tokio::time::timeout(Duration::from_secs(3), conn.closed())
            .await
            .expect("terminate should drop a connection stuck writing");
        assert!(conn.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_while_send_is_blocked() {
        let (conn, driver, _client) = pair_with_buffer(1024).await;
        driver.spawn(Weak::new());

        conn.send_binary(vec![0u8; 1024 * 1024]).unwrap();
        conn.close(1000, "bye").unwrap();

        // The send never drains; terminate still gets through
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.terminate();
        tokio::time::timeout(Duration::from_secs(3), conn.closed())
            .await
            .expect("terminate should drop a connection stuck closing");
    }

    #[tokio::test]
    async fn test_unread_messages_apply_backpressure() {
        let (conn, driver, mut client) = pair_with_buffer(4096).await;
        driver.spawn(Weak::new());

        // Nobody calls recv(), so the driver must stop reading once the
        // queue is full and the client's writes stall
        let flood = async {
            for i in 0..10_000u32 {
                client.send(Message::text(format!("{i:0>100}"))).await?;
            }
            Ok::<(), tokio_tungstenite::tungstenite::Error>(())
        };
        assert!(
            tokio::time::timeout(Duration::from_secs(2), flood)
                .await
                .is_err()
        );

        // Buffered messages are delivered in order
        assert_eq!(conn.recv().await, Some(Message::text(format!("{:0>100}", 0))));
        assert_eq!(conn.recv().await, Some(Message::text(format!("{:0>100}", 1))));
    }

    #[tokio::test]
    async fn test_closed_without_driver() {
        let (conn, driver, _client) = pair().await;
        drop(driver);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }
}
