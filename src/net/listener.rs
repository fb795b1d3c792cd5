// TCP listener and server
// Accepts line-JSON clients and hands each one to a JsonClient task

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::connection::Connection;
use super::json_client::JsonClient;
use crate::broker::Broker;

/// TCP server that accepts and manages client connections
pub struct TcpServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    /// Bind `addr` and start accepting. Port 0 picks a free port; see [`addr`](Self::addr).
    pub async fn start(addr: SocketAddr, broker: Arc<Broker>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let broker = Arc::clone(&broker);
                                tokio::spawn(async move {
                                    let client = JsonClient::new(Connection::new(stream, peer_addr), broker);
                                    if let Err(e) = client.run().await {
                                        warn!(%peer_addr, "TCP client error: {}", e);
                                    }
                                });
                            }
                            Err(e) => error!("Accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("TCP server on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        info!("Line-JSON clients listening on {} (TCP)", local_addr);
        Ok(TcpServer {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting; established sessions are unaffected
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::test_broker;
    use crate::registry::ClientRole;
    use std::time::Duration;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn next_frame<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> serde_json::Value {
        let line = timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn wait_for_sessions(broker: &Broker, n: usize) {
        timeout(Duration::from_secs(2), async {
            while broker.registry().len().await != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_tracker_to_viewer_over_tcp() {
        let (broker, _) = test_broker(50);
        let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), broker.clone())
            .await
            .unwrap();

        let mut viewer = BufReader::new(TcpStream::connect(server.addr()).await.unwrap()).lines();
        assert_eq!(next_frame(&mut viewer).await["type"], "welcome");

        let (tracker_read, mut tracker) = TcpStream::connect(server.addr()).await.unwrap().into_split();
        let mut tracker_lines = BufReader::new(tracker_read).lines();
        assert_eq!(next_frame(&mut tracker_lines).await["type"], "welcome");

        tracker
            .write_all(b"{\"type\":\"identify\",\"clientType\":\"tracker\"}\n")
            .await
            .unwrap();
        tracker.write_all(b"garbage\n").await.unwrap();
        tracker
            .write_all(b"{\"type\":\"arkit_location\",\"data\":{\"position3D\":{\"x\":1.0,\"y\":2.0,\"z\":3.0},\"accuracy\":0.5,\"timestamp\":1714557600000}}\n")
            .await
            .unwrap();

        let update = next_frame(&mut viewer).await;
        assert_eq!(update["type"], "location_update");
        assert_eq!(update["data"]["position3D"]["y"], 2.0);
        assert_eq!(broker.stats().snapshot().decode_errors, 1);

        let roles: Vec<ClientRole> = broker.registry().snapshot().await.iter().map(|s| s.role).collect();
        assert!(roles.contains(&ClientRole::Tracker));

        drop(tracker);
        drop(tracker_lines);
        wait_for_sessions(&broker, 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_notice_then_close() {
        let (broker, _) = test_broker(50);
        let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), broker.clone())
            .await
            .unwrap();
        let mut client = BufReader::new(TcpStream::connect(server.addr()).await.unwrap()).lines();
        assert_eq!(next_frame(&mut client).await["type"], "welcome");
        wait_for_sessions(&broker, 1).await;

        broker.shutdown().await;

        assert_eq!(next_frame(&mut client).await["type"], "server_shutdown");
        let eof = timeout(Duration::from_secs(2), client.next_line()).await.unwrap().unwrap();
        assert!(eof.is_none());
        wait_for_sessions(&broker, 0).await;
    }

    #[tokio::test]
    async fn test_probe_is_heartbeat_line() {
        let (broker, _) = test_broker(50);
        let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), broker.clone())
            .await
            .unwrap();
        let mut client = BufReader::new(TcpStream::connect(server.addr()).await.unwrap()).lines();
        next_frame(&mut client).await;
        wait_for_sessions(&broker, 1).await;

        for handle in broker.registry().handles().await {
            handle.probe();
        }
        let probe = next_frame(&mut client).await;
        assert_eq!(probe["type"], "heartbeat");
        assert!(probe["serverTime"].is_string());
    }

    #[tokio::test]
    async fn test_unterminated_flood_drops_session() {
        let (broker, _) = test_broker(50);
        let server = TcpServer::start("127.0.0.1:0".parse().unwrap(), broker.clone())
            .await
            .unwrap();
        let (read, mut write) = TcpStream::connect(server.addr()).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();
        next_frame(&mut lines).await;
        wait_for_sessions(&broker, 1).await;

        let flood = vec![b'x'; crate::constants::MAX_LINE_BYTES + 1024];
        // The server may hang up before the whole flood is written
        let _ = write.write_all(&flood).await;
        wait_for_sessions(&broker, 0).await;
    }
}
