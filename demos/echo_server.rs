//! Echo server on a dedicated port
//!
//! Accepts clients whose origin is localhost (or who send none) and echoes
//! every message back.
//! Run with: cargo run --example echo_server

use sockudo_ws_server::prelude::*;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sockudo_ws_server=debug,echo_server=info".into()),
        )
        .init();

    let options = ServerOptions::builder()
        .port(9001)
        .host([127, 0, 0, 1].into())
        .verify_client(|info| {
            info.origin()
                .is_none_or(|origin| origin.starts_with("http://localhost"))
        })
        .build()?;
    let server = WebSocketServer::new(options)?;
    let mut events = server.subscribe();

    info!("Echo server listening on ws://{:?}", server.local_addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ServerEvent::Connection(conn)) => {
                    info!("{} connected ({} clients)", conn.id(), server.client_count());
                    tokio::spawn(echo(conn));
                }
                Some(ServerEvent::Rejected { status, reason, peer_addr }) => {
                    info!("Rejected {:?} with {}: {}", peer_addr, status, reason);
                }
                Some(ServerEvent::Error(e)) => info!("Server error: {}", e),
                Some(ServerEvent::Closed) | None => break,
            },
        }
    }

    server.close().await;
    Ok(())
}

async fn echo(conn: Connection) {
    while let Some(msg) = conn.recv().await {
        if conn.send(msg).is_err() {
            break;
        }
    }
    info!("{} disconnected", conn.id());
}
