//! WebSocket Transport Integration Tests
//!
//! Runs the WebSocket transport against an in-process tungstenite server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use session_supervisor::infrastructure::config::StreamSettings;
use session_supervisor::{
    Credential, DisconnectReason, InstrumentId, StreamTransport, SubscriptionMode,
    TransportError, TransportEvent, WebSocketTransport,
};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one WebSocket connection and hand it to `handler`.
async fn spawn_server<F, Fut>(handler: F) -> SocketAddr
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(socket).await;
    });

    addr
}

fn transport(addr: SocketAddr) -> WebSocketTransport {
    WebSocketTransport::new(StreamSettings::new(format!("ws://{addr}/ws"), "test-key"))
}

fn credential(token: &str) -> Credential {
    Credential::new(token, Utc::now())
}

async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// Next text message, skipping control frames.
async fn next_text(socket: &mut ServerSocket) -> serde_json::Value {
    loop {
        match timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

fn packet(token: u32, body: &[u8]) -> Vec<u8> {
    let mut packet = token.to_be_bytes().to_vec();
    packet.extend_from_slice(body);
    packet
}

fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = u16::try_from(packets.len()).unwrap().to_be_bytes().to_vec();
    for packet in packets {
        out.extend_from_slice(&u16::try_from(packet.len()).unwrap().to_be_bytes());
        out.extend_from_slice(packet);
    }
    out
}

#[tokio::test]
async fn test_connect_passes_credentials_in_query() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| {
            let _ = uri_tx.send(request.uri().to_string());
            Ok::<_, ErrorResponse>(response)
        };
        let mut socket = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        while socket.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::channel(16);
    let handle = transport(addr)
        .connect(&credential("tok-1"), tx)
        .await
        .unwrap();

    let uri = timeout(WAIT, uri_rx).await.unwrap().unwrap();
    assert_eq!(uri, "/ws?api_key=test-key&access_token=tok-1");
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Connected { handle: id } if id == handle.id()
    ));
}

#[tokio::test]
async fn test_handshake_forbidden_is_credential_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut error = ErrorResponse::new(Some("Invalid access token".to_string()));
            *error.status_mut() = StatusCode::FORBIDDEN;
            Err(error)
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    });

    let (tx, _rx) = mpsc::channel(16);
    let err = transport(addr)
        .connect(&credential("expired"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::CredentialRejected(_)));
}

#[tokio::test]
async fn test_unreachable_server_is_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, _rx) = mpsc::channel(16);
    let err = transport(addr)
        .connect(&credential("tok-1"), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::ConnectionFailed(_)));
}

#[tokio::test]
async fn test_subscribe_sends_subscribe_then_mode() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let addr = spawn_server(|mut socket| async move {
        let subscribe = next_text(&mut socket).await;
        let mode = next_text(&mut socket).await;
        let unsubscribe = next_text(&mut socket).await;
        let _ = seen_tx.send((subscribe, mode, unsubscribe));
    })
    .await;

    let transport = transport(addr);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = transport.connect(&credential("tok-1"), tx).await.unwrap();
    next_event(&mut rx).await;

    let instruments = [InstrumentId::new(408_065), InstrumentId::new(884_737)];
    transport
        .subscribe(&handle, &instruments, SubscriptionMode::Full)
        .await
        .unwrap();
    transport
        .unsubscribe(&handle, &instruments[..1])
        .await
        .unwrap();

    let (subscribe, mode, unsubscribe) = timeout(WAIT, seen_rx).await.unwrap().unwrap();
    assert_eq!(
        subscribe,
        serde_json::json!({ "a": "subscribe", "v": [408_065, 884_737] })
    );
    assert_eq!(
        mode,
        serde_json::json!({ "a": "mode", "v": ["full", [408_065, 884_737]] })
    );
    assert_eq!(
        unsubscribe,
        serde_json::json!({ "a": "unsubscribe", "v": [408_065] })
    );
}

#[tokio::test]
async fn test_binary_frames_become_ticks() {
    let addr = spawn_server(|mut socket| async move {
        socket.send(Message::Binary(vec![0].into())).await.unwrap();
        let data = frame(&[packet(408_065, &[0, 0, 1, 0]), packet(256_265, &[9; 40])]);
        socket.send(Message::Binary(data.into())).await.unwrap();
        while socket.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(16);
    transport(addr)
        .connect(&credential("tok-1"), tx)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Connected { .. }
    ));

    let mut instruments = Vec::new();
    for _ in 0..2 {
        match next_event(&mut rx).await {
            TransportEvent::Tick { tick, .. } => instruments.push(tick.instrument),
            other => panic!("expected tick, got {other:?}"),
        }
    }

    assert_eq!(
        instruments,
        vec![InstrumentId::new(408_065), InstrumentId::new(256_265)]
    );
}

#[tokio::test]
async fn test_malformed_frame_is_reported_as_error() {
    let addr = spawn_server(|mut socket| async move {
        socket
            .send(Message::Binary(vec![0, 3, 0, 8].into()))
            .await
            .unwrap();
        while socket.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(16);
    transport(addr)
        .connect(&credential("tok-1"), tx)
        .await
        .unwrap();
    next_event(&mut rx).await;

    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Error { .. }
    ));
}

#[tokio::test]
async fn test_server_close_is_reported_once() {
    let addr = spawn_server(|mut socket| async move {
        socket
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "maintenance".into(),
            })))
            .await
            .unwrap();
        while socket.next().await.is_some() {}
    })
    .await;

    let transport = transport(addr);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = transport.connect(&credential("tok-1"), tx).await.unwrap();
    next_event(&mut rx).await;

    match next_event(&mut rx).await {
        TransportEvent::Disconnected { handle: id, reason } => {
            assert_eq!(id, handle.id());
            assert_eq!(
                reason,
                DisconnectReason::ServerClosed {
                    code: Some(1001),
                    reason: "maintenance".to_string(),
                }
            );
        }
        other => panic!("expected disconnect, got {other:?}"),
    }

    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert_eq!(transport.active_connections(), 0);
}

#[tokio::test]
async fn test_token_error_message_is_credential_rejection() {
    let addr = spawn_server(|mut socket| async move {
        let error = r#"{"type":"error","data":"Invalid access token"}"#;
        socket.send(Message::Text(error.into())).await.unwrap();
        while socket.next().await.is_some() {}
    })
    .await;

    let (tx, mut rx) = mpsc::channel(16);
    transport(addr)
        .connect(&credential("tok-1"), tx)
        .await
        .unwrap();
    next_event(&mut rx).await;

    match next_event(&mut rx).await {
        TransportEvent::Disconnected { reason, .. } => {
            assert!(reason.is_credential_rejection());
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_other_error_message_is_not_fatal() {
    let addr = spawn_server(|mut socket| async move {
        let error = r#"{"type":"error","data":"Too many instruments"}"#;
        socket.send(Message::Text(error.into())).await.unwrap();
        while socket.next().await.is_some() {}
    })
    .await;

    let transport = transport(addr);
    let (tx, mut rx) = mpsc::channel(16);
    transport.connect(&credential("tok-1"), tx).await.unwrap();
    next_event(&mut rx).await;

    match next_event(&mut rx).await {
        TransportEvent::Error { message, .. } => assert_eq!(message, "Too many instruments"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(transport.active_connections(), 1);
}

#[tokio::test]
async fn test_local_close_reports_no_disconnect() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let addr = spawn_server(|mut socket| async move {
        while let Some(Ok(message)) = socket.next().await {
            if message.is_close() {
                break;
            }
        }
        let _ = closed_tx.send(());
    })
    .await;

    let transport = transport(addr);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = transport.connect(&credential("tok-1"), tx).await.unwrap();
    next_event(&mut rx).await;

    transport.close(&handle).await.unwrap();
    timeout(WAIT, closed_rx).await.unwrap().unwrap();

    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert_eq!(transport.active_connections(), 0);

    let err = transport
        .subscribe(&handle, &[InstrumentId::new(1)], SubscriptionMode::Ltp)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownHandle(id) if id == handle.id()));
    assert!(transport.close(&handle).await.is_ok());
}
