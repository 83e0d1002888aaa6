//! WebSocket chat client.
//!
//! Thin client over the binary protocol: connect, identify, then exchange
//! events. Server pushes arrive on an event channel the application drains
//! at its own pace. Used by the integration tests and development tools;
//! real clients only need to speak the same frames.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{
    ClientEvent, ConversationId, MediaRef, MessageId, ProtocolError, RejectReason, ServerEvent,
    UserId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The chat client.
pub struct ChatClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the server-event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect to the relay. Spawns reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Outgoing channel dropped: close the connection properly so
            // the server runs its disconnect handling promptly.
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        // Reader task: decode server pushes into the event channel.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerEvent::decode(&bytes) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Undecodable server frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Encode and send one event to the server.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = event.encode()?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Announce identity. Must precede every other event on the connection.
    pub async fn identify(&self, credential: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Identify {
            credential: credential.into(),
        })
        .await
    }

    pub async fn send_message(
        &self,
        conversation: impl Into<ConversationId>,
        content: Option<String>,
        media: Option<MediaRef>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SendMessage {
            conversation: conversation.into(),
            content,
            media,
        })
        .await
    }

    pub async fn mark_read(
        &self,
        conversation: impl Into<ConversationId>,
        message_ids: Vec<MessageId>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::MarkRead {
            conversation: conversation.into(),
            message_ids,
        })
        .await
    }

    pub async fn delete_message(&self, message_id: impl Into<MessageId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::DeleteMessage {
            message_id: message_id.into(),
        })
        .await
    }

    pub async fn typing_start(&self, conversation: impl Into<ConversationId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::TypingStart {
            conversation: conversation.into(),
        })
        .await
    }

    pub async fn typing_stop(&self, conversation: impl Into<ConversationId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::TypingStop {
            conversation: conversation.into(),
        })
        .await
    }

    pub async fn call_initiate(
        &self,
        callee: impl Into<UserId>,
        offer: impl Into<String>,
        audio_only: bool,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CallInitiate {
            callee: callee.into(),
            offer: offer.into(),
            audio_only,
        })
        .await
    }

    pub async fn call_accept(
        &self,
        caller: impl Into<UserId>,
        answer: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CallAccept {
            caller: caller.into(),
            answer: answer.into(),
        })
        .await
    }

    pub async fn call_reject(
        &self,
        peer: impl Into<UserId>,
        reason: RejectReason,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CallReject {
            peer: peer.into(),
            reason,
        })
        .await
    }

    pub async fn ice_candidate(
        &self,
        peer: impl Into<UserId>,
        candidate: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::IceCandidate {
            peer: peer.into(),
            candidate: candidate.into(),
        })
        .await
    }

    pub async fn hang_up(&self, peer: impl Into<UserId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::HangUp { peer: peer.into() }).await
    }

    /// Drop the outgoing channel, closing the connection.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let client = ChatClient::new("ws://127.0.0.1:1");
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = ChatClient::new("ws://127.0.0.1:1");
        let result = client.identify("u1").await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_event_rx_taken_once() {
        let mut client = ChatClient::new("ws://127.0.0.1:1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        // Port 1 is never a listening WebSocket server.
        let mut client = ChatClient::new("ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
    }
}
