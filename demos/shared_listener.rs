//! Two servers sharing one listener by path
//!
//! `/chat` broadcasts every message to all chat clients, `/time` sends the
//! current unix time once a second. Plain HTTP requests get a short text
//! answer from the listener's request handler.
//! Run with: cargo run --example shared_listener

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sockudo_ws_server::prelude::*;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let listener = HttpListener::bind("127.0.0.1:9002".parse().map_err(|_| {
        Error::Configuration("invalid listen address".into())
    })?)?
    .with_request_handler(|req| {
        http::Response::new(Bytes::from(format!(
            "connect a WebSocket client to /chat or /time (you asked for {})\n",
            req.path()
        )))
    });

    let chat = WebSocketServer::new(
        ServerOptions::builder()
            .listener(listener.clone())
            .path("/chat")
            .build()?,
    )?;
    let time = WebSocketServer::new(
        ServerOptions::builder()
            .listener(listener.clone())
            .path("/time")
            .build()?,
    )?;

    let addr = listener.local_addr();
    info!("Listening on ws://{}/chat and ws://{}/time", addr, addr);

    let mut chat_events = chat.subscribe();
    let mut time_events = time.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = chat_events.recv() => {
                if let ServerEvent::Connection(conn) = event {
                    let registry = chat.registry().clone();
                    tokio::spawn(async move {
                        while let Some(msg) = conn.recv().await {
                            registry.for_each(|peer| {
                                let _ = peer.send(msg.clone());
                            });
                        }
                    });
                }
            }
            Some(event) = time_events.recv() => {
                if let ServerEvent::Connection(conn) = event {
                    info!("{} subscribed to /time", conn.id());
                }
            }
            _ = tick.tick() => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                for conn in time.clients() {
                    let _ = conn.send_text(now.to_string());
                }
            }
        }
    }

    chat.close().await;
    time.close().await;
    listener.close();
    Ok(())
}
