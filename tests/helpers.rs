// tests/helpers.rs
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use signal_streamer::config::{ReconnectSettings, RecoverySettings, Settings, StreamSettings};
use signal_streamer::connection::ConnectionState;

const WAIT: Duration = Duration::from_secs(5);

/// In-process WebSocket server; every accepted client lands on the
/// connection queue so tests can script it.
pub struct TestServer {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl TestServer {
    pub async fn accept(&mut self) -> Result<ServerConnection> {
        timeout(WAIT, self.connections.recv())
            .await
            .map_err(|_| anyhow::anyhow!("no client connected in time"))?
            .ok_or_else(|| anyhow::anyhow!("listener task stopped"))
    }

    /// True when no further client connects within the grace period.
    pub async fn no_new_connection(&mut self, grace: Duration) -> bool {
        timeout(grace, self.connections.recv()).await.is_err()
    }
}

/// One accepted client connection, driven by the test script.
pub struct ServerConnection {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConnection {
    pub async fn send_frame(&mut self, frame: Value) -> Result<()> {
        self.ws
            .send(WsMessage::Text(frame.to_string().into()))
            .await?;
        Ok(())
    }

    pub async fn send_connected(&mut self, connection_id: &str) -> Result<()> {
        self.send_frame(json!({
            "type": "connected",
            "connectionId": connection_id,
            "sequenceNumber": 0,
        }))
        .await
    }

    pub async fn send_update(
        &mut self,
        kind: &str,
        sequence_number: u64,
        payload: Value,
    ) -> Result<()> {
        self.send_frame(update_frame(kind, sequence_number, payload))
            .await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.ws.send(WsMessage::Ping(payload.to_vec().into())).await?;
        Ok(())
    }

    pub async fn next_message(&mut self) -> Result<WsMessage> {
        let message = timeout(WAIT, self.ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("no frame from client in time"))?
            .ok_or_else(|| anyhow::anyhow!("client closed the connection"))??;
        Ok(message)
    }

    /// Kill the TCP connection without a closing handshake.
    pub fn drop_abruptly(self) {}
}

/// Wire shape of one update frame: envelope plus flattened payload.
pub fn update_frame(kind: &str, sequence_number: u64, payload: Value) -> Value {
    let mut frame = serde_json::Map::new();
    frame.insert("type".to_string(), json!(kind));
    frame.insert("sequenceNumber".to_string(), json!(sequence_number));
    frame.insert("timestamp".to_string(), json!("2026-01-05T09:30:00Z"));
    if let Value::Object(extra) = payload {
        frame.extend(extra);
    }
    Value::Object(frame)
}

pub async fn spawn_test_server() -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve(listener)
}

/// Bind a specific address, used to bring an endpoint back up after
/// simulating an outage on it.
pub async fn spawn_test_server_at(addr: SocketAddr) -> Result<TestServer> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener)
}

fn serve(listener: TcpListener) -> Result<TestServer> {
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if tx.send(ServerConnection { ws }).is_err() {
                break;
            }
        }
    });

    Ok(TestServer {
        addr,
        connections: rx,
    })
}

/// Minimal HTTP stub for the replay endpoint: answers every request with
/// the same JSON batch.
pub async fn spawn_recovery_stub(batch: Vec<Value>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let body = Value::Array(batch).to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                // Drain the request head; the answer is canned anyway.
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            head.extend_from_slice(&buf[..n]);
                            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Ok(base_url)
}

/// An address nothing listens on (bound once, then released).
pub async fn dead_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub fn test_settings(stream_addr: SocketAddr, recovery_base_url: &str) -> Settings {
    Settings {
        stream: StreamSettings {
            url: format!("ws://{stream_addr}"),
            connect_timeout_secs: 5,
        },
        recovery: RecoverySettings {
            base_url: recovery_base_url.to_string(),
            fetch_timeout_secs: 2,
        },
        reconnect: ReconnectSettings {
            base_delay_ms: 30,
            max_delay_ms: 200,
            max_attempts: 5,
        },
    }
}

pub async fn wait_for_state(
    status: &mut tokio::sync::watch::Receiver<ConnectionState>,
    want: ConnectionState,
) -> Result<()> {
    timeout(WAIT, status.wait_for(|s| *s == want))
        .await
        .map_err(|_| anyhow::anyhow!("status never reached {want:?}"))??;
    Ok(())
}
