//! Manual upgrade handling
//!
//! The application owns the TCP listener and reads request heads itself;
//! only requests for `/ws` are handed to the WebSocket server.
//! Run with: cargo run --example manual_upgrade

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{info, warn};

use sockudo_ws_server::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let server = std::sync::Arc::new(WebSocketServer::new(
        ServerOptions::builder().no_server().build()?,
    )?);
    let listener = TcpListener::bind("127.0.0.1:9003").await?;
    info!("Manual upgrade server listening on ws://127.0.0.1:9003/ws");

    loop {
        let (tcp, addr) = listener.accept().await?;
        let server = server.clone();

        tokio::spawn(async move {
            let mut socket = Socket::new(tcp);
            let (request, head) = match read_request(&mut socket).await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Bad request from {}: {}", addr, e);
                    return;
                }
            };

            if request.path() != "/ws" {
                let _ = not_found(socket).await;
                return;
            }

            match server.handle_upgrade(request, socket, head).await {
                Ok(conn) => {
                    let _ = conn.send_text("welcome");
                    while let Some(msg) = conn.recv().await {
                        if conn.send(msg).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => info!("Upgrade from {} rejected: {}", addr, e),
            }
        });
    }
}

async fn not_found(mut socket: Socket) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = Bytes::from_static(b"Not Found");
    socket
        .write_all(
            format!(
                "HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await?;
    socket.write_all(&body).await?;
    socket.shutdown().await
}
