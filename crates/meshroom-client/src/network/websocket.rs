use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use meshroom_protocol::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::transport::{Credentials, SignalingTransport, TransportEvent, TransportEvents};
use crate::error::{Result, RoomError};

const CHANNEL_CAPACITY: usize = 100;
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Signaling transport over a JSON WebSocket
#[derive(Default)]
pub struct WebSocketTransport {
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    sender: mpsc::Sender<ClientMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<TransportEvents> {
        // Drop any previous connection first
        self.close().await;

        let (ws_stream, _) = connect_async(credentials.url.as_str())
            .await
            .map_err(RoomError::transport)?;

        let (mut write, mut read) = ws_stream.split();

        // Authenticate
        let auth_msg = ClientMessage::Authenticate {
            token: credentials.token.clone(),
        };
        let json = serde_json::to_string(&auth_msg).map_err(RoomError::transport)?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(RoomError::transport)?;

        // Wait for authentication response
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let response: ServerMessage =
                    serde_json::from_str(&text).map_err(RoomError::transport)?;
                match response {
                    ServerMessage::Authenticated { connection_id } => {
                        tracing::info!(
                            "Signaling channel authenticated with connection ID: {}",
                            connection_id
                        );
                    }
                    ServerMessage::SignalingError { message } => {
                        return Err(RoomError::SignalingProtocol(message));
                    }
                    other => {
                        return Err(RoomError::transport(format!(
                            "Unexpected response during authentication: {:?}",
                            other
                        )));
                    }
                }
            }
            Some(Err(e)) => return Err(RoomError::transport(e)),
            _ => {
                return Err(RoomError::transport(
                    "Connection closed during authentication",
                ));
            }
        }

        let (tx, mut rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        // Outgoing messages
        let outgoing = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send signaling message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming messages
        let incoming = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Pong) => {}
                            Ok(msg) => {
                                if event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                    // Nobody is listening any more
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Ignoring malformed signaling message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Signaling channel closed by server");
                        break frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Err(e)) => {
                        tracing::error!("Signaling channel error: {}", e);
                        break e.to_string();
                    }
                    // Ping/pong frames are handled by tungstenite
                    Some(Ok(_)) => {}
                    None => break "connection lost".to_string(),
                }
            };

            let _ = event_tx.send(TransportEvent::Closed { reason }).await;
        });

        // Keepalive
        let tx_ping = tx.clone();
        let pinger = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx_ping.send(ClientMessage::Ping).await.is_err() {
                    break;
                }
            }
        });

        *self.connection.lock().await = Some(Connection {
            sender: tx,
            tasks: vec![outgoing, incoming, pinger],
        });

        Ok(event_rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let sender = self
            .connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.sender.clone())
            .ok_or_else(|| RoomError::transport("Not connected"))?;

        sender
            .send(message)
            .await
            .map_err(|_| RoomError::transport("Signaling channel closed"))
    }

    async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            // Dropping the sender lets the writer flush and send a close frame
            drop(connection.sender);
            for task in connection.tasks.iter().skip(1) {
                task.abort();
            }
            tracing::debug!("Signaling channel closed");
        }
    }
}
