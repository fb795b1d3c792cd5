// WebSocket transport
// One task per socket: queued frames out, client frames into the dispatcher.
// Liveness probes become native Ping frames; the Pong marks the session alive.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::broker::Broker;
use crate::registry::{Outbound, TransportKind};

/// Upgrade handler mounted on the router
pub async fn ws_handler(
    State(broker): State<Arc<Broker>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, peer))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>, peer: Option<SocketAddr>) {
    let (handle, mut outbound) = broker.connect(TransportKind::WebSocket, peer).await;
    let mut dispatcher = broker.dispatcher(handle.clone());
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            Some(item) = outbound.recv() => {
                let message = match item {
                    Outbound::Text(text) => Message::Text(text.to_string()),
                    Outbound::Probe => Message::Ping(Vec::new()),
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            _ = handle.closed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = dispatcher.handle_frame(&text).await;
                    }
                    Some(Ok(Message::Pong(_))) => handle.mark_alive(),
                    Some(Ok(Message::Ping(_))) => trace!(session = handle.id(), "Received ping"),
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session = handle.id(), "Ignoring binary WebSocket message");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session = handle.id(), "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    broker.disconnect(handle.id()).await;
}
