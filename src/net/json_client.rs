// JSON client handler
// Drives one line-JSON TCP session: inbound lines go to the dispatcher,
// queued outbound frames go to the socket.

use chrono::Utc;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::Connection;
use super::messages::ServerMessage;
use crate::broker::Broker;
use crate::registry::{Outbound, TransportKind};

pub struct JsonClient {
    connection: Connection,
    broker: Arc<Broker>,
}

impl JsonClient {
    pub fn new(connection: Connection, broker: Arc<Broker>) -> Self {
        JsonClient { connection, broker }
    }

    /// Run until EOF, a socket error, or the session is closed by the broker.
    ///
    /// The session is always removed from the registry on return.
    pub async fn run(mut self) -> io::Result<()> {
        let peer = self.connection.peer_addr();
        let (handle, mut outbound) = self.broker.connect(TransportKind::Tcp, Some(peer)).await;
        let mut dispatcher = self.broker.dispatcher(handle.clone());

        let result = loop {
            tokio::select! {
                // Drain queued frames before honouring a close, so the
                // shutdown notice goes out first
                biased;

                Some(item) = outbound.recv() => {
                    let frame = match item {
                        Outbound::Text(text) => text,
                        // No ping frames on raw TCP; any inbound line answers this
                        Outbound::Probe => match (ServerMessage::Heartbeat { server_time: Utc::now() }).encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(session = handle.id(), "Failed to encode heartbeat: {}", e);
                                continue;
                            }
                        },
                    };
                    if let Err(e) = self.connection.write_line(&frame).await {
                        break Err(e);
                    }
                }
                _ = handle.closed() => {
                    debug!(session = handle.id(), "Session closed by broker");
                    break Ok(());
                }
                line = self.connection.read_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            // Per-frame errors are logged and counted by the dispatcher
                            let _ = dispatcher.handle_frame(&line).await;
                        }
                        Ok(None) => {
                            debug!(session = handle.id(), %peer, "Client EOF");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let _ = self.connection.shutdown().await;
        self.broker.disconnect(handle.id()).await;
        result
    }
}
