#![forbid(unsafe_code)]

// Signaling transport - one WebSocket to the relay, split into a writer task
// fed by a channel and a reader task that decodes server messages. The writer
// pings the relay on a fixed interval so quiet sessions are not reaped as idle.

use super::ClientError;
use crate::signaling::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SignalingClient {
    outgoing: Option<mpsc::Sender<ClientMessage>>,
    incoming: mpsc::Receiver<ServerMessage>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &str, keepalive: Duration) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            let mut pings = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
            loop {
                let frame = tokio::select! {
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else { break };
                        match serde_json::to_string(&msg) {
                            Ok(json) => Message::Text(json.into()),
                            Err(e) => {
                                warn!("Failed to encode {}: {}", msg.name(), e);
                                continue;
                            }
                        }
                    }
                    _ = pings.tick() => Message::Ping(Default::default()),
                };
                if write.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Undecodable message from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outgoing: Some(outgoing_tx),
            incoming: incoming_rx,
            writer: Some(writer),
            reader,
        })
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let Some(outgoing) = &self.outgoing else {
            return Err(ClientError::Transport("connection closed".to_string()));
        };
        outgoing
            .send(msg)
            .await
            .map_err(|_| ClientError::Transport("connection closed".to_string()))
    }

    pub async fn send_all(&self, messages: Vec<ClientMessage>) -> Result<(), ClientError> {
        for msg in messages {
            self.send(msg).await?;
        }
        Ok(())
    }

    /// Next message from the relay; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.incoming.recv().await
    }

    /// Flushes queued messages and closes the socket
    pub async fn close(&mut self) {
        self.outgoing.take();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("Timed out flushing messages to the relay");
            }
        }
        self.reader.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.abort();
        }
        self.reader.abort();
    }
}
