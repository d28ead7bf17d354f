//! WebSocket Stream Transport
//!
//! [`StreamTransport`] adapter over `tokio-tungstenite`. Each `connect`
//! spawns one task that owns the socket: it writes queued control messages,
//! pings on an interval, decodes inbound frames into [`TransportEvent`]s and
//! reports exactly one `Disconnected` when the socket dies on its own.
//! Connections torn down through [`StreamTransport::close`] report nothing.
//!
//! # Connection URL
//!
//! `{base}?api_key={key}&access_token={token}`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message, http::StatusCode};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{BinaryFrame, ControlRequest, TextFrame, decode_binary, decode_text};
use super::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::application::ports::{
    StreamTransport, TransportError, TransportEvent, TransportEventSender,
};
use crate::domain::connection::{Credential, DisconnectReason, HandleId, TransportHandle};
use crate::domain::subscription::{InstrumentId, SubscriptionMode};
use crate::infrastructure::config::StreamSettings;

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
struct Connection {
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

type Connections = Arc<Mutex<HashMap<HandleId, Connection>>>;

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket market data transport.
pub struct WebSocketTransport {
    settings: StreamSettings,
    heartbeat: HeartbeatConfig,
    next_id: AtomicU64,
    connections: Connections,
}

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub fn new(settings: StreamSettings) -> Self {
        let heartbeat = HeartbeatConfig::new(settings.ping_interval, settings.heartbeat_timeout);
        Self {
            settings,
            heartbeat,
            next_id: AtomicU64::new(0),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live sockets.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    fn connect_url(&self, credential: &Credential) -> String {
        let separator = if self.settings.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}api_key={}&access_token={}",
            self.settings.url,
            self.settings.api_key(),
            credential.token()
        )
    }

    fn outbound(&self, handle: &TransportHandle) -> Result<mpsc::Sender<Message>, TransportError> {
        self.connections
            .lock()
            .get(&handle.id())
            .map(|c| c.outbound.clone())
            .ok_or(TransportError::UnknownHandle(handle.id()))
    }

    async fn send(&self, handle: &TransportHandle, request: ControlRequest) -> Result<(), TransportError> {
        let outbound = self.outbound(handle)?;
        tracing::trace!(handle = %handle.id(), request = ?request, "Sending control message");
        outbound
            .send(Message::Text(request.to_json().into()))
            .await
            .map_err(|_| TransportError::SendFailed(format!("connection {} is closed", handle.id())))
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(
        &self,
        credential: &Credential,
        events: TransportEventSender,
    ) -> Result<TransportHandle, TransportError> {
        tracing::info!(url = %self.settings.url, "Connecting to market data stream");

        let url = self.connect_url(credential);
        let connect = tokio_tungstenite::connect_async(url);
        let (socket, _response) = tokio::time::timeout(self.settings.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(classify_handshake_error)?;

        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = TransportHandle::new(id, Utc::now());

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();
        self.connections.lock().insert(
            id,
            Connection {
                outbound: outbound_tx,
                cancel: cancel.clone(),
            },
        );

        let task = ConnectionTask {
            id,
            heartbeat: self.heartbeat,
            events,
            cancel,
            connections: Arc::clone(&self.connections),
        };
        tokio::spawn(task.run(socket, outbound_rx));

        Ok(handle)
    }

    async fn subscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        if instruments.is_empty() {
            return Ok(());
        }
        self.send(handle, ControlRequest::Subscribe(instruments.to_vec()))
            .await?;
        self.send(handle, ControlRequest::Mode(mode, instruments.to_vec()))
            .await
    }

    async fn unsubscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
    ) -> Result<(), TransportError> {
        if instruments.is_empty() {
            return Ok(());
        }
        self.send(handle, ControlRequest::Unsubscribe(instruments.to_vec()))
            .await
    }

    async fn close(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        if let Some(connection) = self.connections.lock().remove(&handle.id()) {
            connection.cancel.cancel();
            tracing::debug!(handle = %handle.id(), "Closing stream socket");
        }
        Ok(())
    }
}

fn classify_handshake_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response)
            if matches!(response.status(), StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) =>
        {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::CredentialRejected(format!("HTTP {}: {body}", response.status()))
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct ConnectionTask {
    id: HandleId,
    heartbeat: HeartbeatConfig,
    events: TransportEventSender,
    cancel: CancellationToken,
    connections: Connections,
}

impl ConnectionTask {
    async fn run(self, socket: Socket, mut outbound: mpsc::Receiver<Message>) {
        if self
            .events
            .send(TransportEvent::Connected { handle: self.id })
            .await
            .is_err()
        {
            tracing::debug!(handle = %self.id, "Event channel closed before connect");
        }

        let (mut write, mut read) = socket.split();
        let mut heartbeat = Heartbeat::new(self.heartbeat.timeout);
        let mut ping = tokio::time::interval(self.heartbeat.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;

        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    tracing::debug!(handle = %self.id, "Stream socket closed");
                    return;
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = write.send(message).await {
                        break DisconnectReason::from_message(&e.to_string());
                    }
                }
                _ = ping.tick() => {
                    if heartbeat.is_expired() {
                        tracing::warn!(
                            handle = %self.id,
                            silence_secs = heartbeat.silence().as_secs(),
                            "Heartbeat timeout"
                        );
                        break DisconnectReason::HeartbeatTimeout;
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        break DisconnectReason::from_message(&e.to_string());
                    }
                }
                message = read.next() => {
                    heartbeat.record();
                    match message {
                        Some(Ok(Message::Binary(data))) => self.on_binary(&data).await,
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reason) = self.on_text(&text).await {
                                break reason;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || DisconnectReason::ServerClosed { code: None, reason: String::new() },
                                |f| DisconnectReason::from_close(Some(u16::from(f.code)), &f.reason),
                            );
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break DisconnectReason::from_message(&e.to_string()),
                        None => {
                            break DisconnectReason::ServerClosed {
                                code: None,
                                reason: "stream ended".to_string(),
                            };
                        }
                    }
                }
            }
        };

        // A concurrent close() already removed us; it must not see a disconnect.
        if self.connections.lock().remove(&self.id).is_none() || self.cancel.is_cancelled() {
            return;
        }

        tracing::warn!(handle = %self.id, reason = %reason, "Stream socket lost");
        let _ = self
            .events
            .send(TransportEvent::Disconnected {
                handle: self.id,
                reason,
            })
            .await;
        let _ = write.close().await;
    }

    async fn on_binary(&self, data: &[u8]) {
        match decode_binary(data, Utc::now()) {
            Ok(BinaryFrame::Heartbeat) => {}
            Ok(BinaryFrame::Ticks(ticks)) => {
                for tick in ticks {
                    let event = TransportEvent::Tick {
                        handle: self.id,
                        tick,
                    };
                    if self.events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(TransportEvent::Error {
                        handle: self.id,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Returns a disconnect reason when the server rejected the credential.
    async fn on_text(&self, text: &str) -> Option<DisconnectReason> {
        match decode_text(text) {
            Ok(TextFrame::Error(message)) => {
                let reason = DisconnectReason::from_message(&message);
                if reason.is_credential_rejection() {
                    return Some(reason);
                }
                let _ = self
                    .events
                    .send(TransportEvent::Error {
                        handle: self.id,
                        message,
                    })
                    .await;
            }
            Ok(TextFrame::Other(kind)) => {
                tracing::trace!(handle = %self.id, kind = %kind, "Ignoring text message");
            }
            Err(e) => {
                tracing::debug!(handle = %self.id, error = %e, "Undecodable text message");
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
