//! Browser stream proxy.
//!
//! On upgrade of `/api/agents/:slug/browser/stream`, splice the UI client
//! to the agent container's internal stream at
//! `ws://127.0.0.1:<port>/browser/stream`. Framing is preserved — text
//! stays text, binary stays binary — and either side closing closes the
//! peer. Upstream trouble closes the client with 1011.

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use waystation_core::types::ContainerState;

use crate::state::AppState;

const INTERNAL_ERROR: u16 = 1011;

/// `GET /api/agents/:slug/browser/stream` (WebSocket upgrade).
pub async fn browser_stream_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let status = state.manager.status(&slug);
    let target = if status.status == ContainerState::Running {
        status.port
    } else {
        None
    };
    ws.on_upgrade(move |socket| async move {
        match target {
            Some(port) => splice(socket, port).await,
            None => {
                close_client(socket, "Agent container is not running").await;
            }
        }
    })
}

async fn close_client(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(ClientMessage::Close(Some(CloseFrame {
            code: INTERNAL_ERROR,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn splice(client: WebSocket, port: u16) {
    let url = format!("ws://127.0.0.1:{}/browser/stream", port);
    let upstream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::warn!(port, error = %e, "browser stream dial failed");
            close_client(client, "Upstream connection error").await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let Ok(message) = message else { break };
            let Some(converted) = client_to_upstream(message) else {
                continue;
            };
            let is_close = matches!(converted, UpstreamMessage::Close(_));
            if upstream_tx.send(converted).await.is_err() || is_close {
                break;
            }
        }
        let _ = upstream_tx
            .send(UpstreamMessage::Close(Some(UpstreamCloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;
    };

    let to_client = async {
        while let Some(message) = upstream_rx.next().await {
            let Ok(message) = message else { break };
            let Some(converted) = upstream_to_client(message) else {
                continue;
            };
            let is_close = matches!(converted, ClientMessage::Close(_));
            if client_tx.send(converted).await.is_err() || is_close {
                break;
            }
        }
        let _ = client_tx.send(ClientMessage::Close(None)).await;
    };

    // Either direction ending tears down the other.
    tokio::select! {
        _ = to_upstream => {}
        _ = to_client => {}
    }
}

fn client_to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data.into())),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data.into())),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data.into())),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|frame| {
            UpstreamCloseFrame {
                code: CloseCode::from(frame.code),
                reason: frame.reason.to_string().into(),
            }
        }))),
    }
}

fn upstream_to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data.into())),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data.into())),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data.into())),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|frame| {
            CloseFrame {
                code: frame.code.into(),
                reason: frame.reason.to_string().into(),
            }
        }))),
        // Raw frames never surface from tungstenite's high-level stream.
        UpstreamMessage::Frame(_) => None,
    }
}
