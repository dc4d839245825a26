//! WebSocket transport for the client port. One tokio task per
//! connection doubles as that connection's serial strand: inbound
//! messages, outbound publishes, and the one-second tick all pass
//! through the same select loop.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::Connection;
use crate::core::Result;
use crate::engine::Platform;

pub async fn run(platform: Arc<Platform>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "client port listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let platform = platform.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => serve(ws, platform, peer.to_string()).await,
                Err(e) => debug!(%peer, "websocket handshake failed: {}", e),
            }
        });
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    platform: Arc<Platform>,
    peer: String,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, rx) = flume::unbounded::<String>();
    let conn = Connection::attach(platform, peer.clone(), tx);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => conn.on_message(&text),
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer = %peer, "websocket read failed: {}", e);
                    break;
                }
            },
            outbound = rx.recv_async() => match outbound {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = tick.tick() => conn.tick(),
        }
    }
    conn.close();
}
