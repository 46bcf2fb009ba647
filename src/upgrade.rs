//! Upgrade pipeline
//!
//! Every upgrade attempt, whether dispatched by a listener or handed in
//! through `WebSocketServer::handle_upgrade`, goes through the same steps:
//!
//! 1. Validate the request head (400 on failure)
//! 2. Ask the admission policy, racing it against server shutdown (401 on decline)
//! 3. Negotiate the sub-protocol and write the 101
//! 4. Hand the socket to the framing codec, register the connection, start
//!    its driver and only then notify subscribers

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::admission::ClientInfo;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake::{self, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL};
use crate::request::Request;
use crate::server::{ServerEvent, Shared};
use crate::transport::Socket;

impl Shared {
    pub(crate) async fn promote(
        &self,
        request: Request,
        mut socket: Socket,
        head: Bytes,
    ) -> Result<Connection> {
        let request = request.with_transport(&socket);
        let options = &self.options;

        let version = match handshake::validate(&request, &options.supported_versions) {
            Ok(version) => version,
            Err(e) => {
                let response = handshake::build_bad_request(e, &options.supported_versions);
                let reason = e.to_string();
                self.reject(&mut socket, &request, StatusCode::BAD_REQUEST, &response, &reason)
                    .await;
                return Err(e.into());
            }
        };

        let request = Arc::new(request);
        let admitted = if self.shutdown.is_cancelled() {
            Err(Error::ServerClosed)
        } else {
            let info = ClientInfo::new(request.clone());
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(Error::ServerClosed),
                admit = options.admission.decide(info, options.admission_timeout) => admit,
            }
        };
        if let Err(e) = admitted {
            let response = handshake::build_rejection(StatusCode::UNAUTHORIZED, &[]);
            self.reject(&mut socket, &request, StatusCode::UNAUTHORIZED, &response, &e.to_string())
                .await;
            return Err(e);
        }

        let proposed = request
            .header(SEC_WEBSOCKET_PROTOCOL)
            .map(handshake::parse_protocols)
            .unwrap_or_default();
        let protocol = options.select_protocol(&proposed, &request);
        let key = request.header(SEC_WEBSOCKET_KEY).unwrap_or_default().trim();
        let response =
            handshake::build_response(&handshake::generate_accept_key(key), protocol.as_deref());

        if let Err(e) = write_response(&mut socket, &response).await {
            warn!("Failed to write handshake response: {}", e);
            let returned = io::Error::new(e.kind(), e.to_string());
            self.emit(ServerEvent::Error(Arc::new(Error::Transport(e))));
            return Err(Error::Transport(returned));
        }

        let ws = WebSocketStream::from_partially_read(
            socket,
            head.to_vec(),
            Role::Server,
            Some(options.websocket_config()),
        )
        .await;
        let (conn, driver) =
            Connection::new(ws, request, protocol, version, options.close_timeout);

        if !self.registry.add(conn.clone()) {
            // The server closed while the 101 was in flight
            debug!("Dropping connection {} accepted during shutdown", conn.id());
            return Err(Error::ServerClosed);
        }
        driver.spawn(Arc::downgrade(&self.registry));

        debug!(
            "Connection {} established (version {}, protocol {:?})",
            conn.id(),
            version,
            conn.protocol()
        );
        self.emit(ServerEvent::Connection(conn.clone()));
        Ok(conn)
    }

    async fn reject(
        &self,
        socket: &mut Socket,
        request: &Request,
        status: StatusCode,
        response: &[u8],
        reason: &str,
    ) {
        debug!(
            "Rejecting upgrade for {} from {:?} with {}: {}",
            request.target(),
            request.peer_addr(),
            status,
            reason
        );
        if let Err(e) = socket.respond_and_close(response).await {
            debug!("Failed to write rejection: {}", e);
        }
        self.emit(ServerEvent::Rejected {
            status,
            reason: reason.to_string(),
            peer_addr: request.peer_addr(),
        });
    }
}

async fn write_response(socket: &mut Socket, response: &[u8]) -> io::Result<()> {
    socket.write_all(response).await?;
    socket.flush().await
}
