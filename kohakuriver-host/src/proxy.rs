//! WebSocket proxying: port-forward and terminal sessions.
//!
//! The host terminates the client's WebSocket, opens a second one to the
//! task's runner and pipes frames symmetrically. For port forwards the
//! runner first sends a literal `CONNECTED` text frame which is relayed
//! before any payload flows. Undelivered frames are dropped when either
//! side closes, never queued.

use crate::routes::{ApiError, AppState};
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message as ClientMessage, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message as RunnerMessage};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub(crate) struct ForwardQuery {
    #[serde(default = "default_proto")]
    proto: String,
}

fn default_proto() -> String {
    "tcp".into()
}

fn ws_base(http_url: &str) -> String {
    match http_url.split_once("://") {
        Some((_, rest)) => format!("ws://{rest}"),
        None => format!("ws://{http_url}"),
    }
}

pub(crate) async fn forward(
    State(state): State<AppState>,
    Path((task_id, port)): Path<(i64, u16)>,
    Query(query): Query<ForwardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let (runner_url, container) = match state.tasks.forward_target(task_id).await {
        Ok(target) => target,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let url = format!("{}/ws/forward/{container}/{port}?proto={}", ws_base(&runner_url), query.proto);
    info!("Forward session: task={task_id}, port={port}, runner={url}");
    ws.on_upgrade(move |socket| async move {
        proxy_session(socket, url, true).await;
        debug!("Forward session ended (task={task_id}:{port})");
    })
}

pub(crate) async fn terminal(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    let (runner_url, _) = match state.tasks.forward_target(task_id).await {
        Ok(target) => target,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let url = format!("{}/ws/task/{task_id}/terminal", ws_base(&runner_url));
    info!("Terminal session: task={task_id}, runner={url}");
    ws.on_upgrade(move |socket| async move {
        proxy_session(socket, url, false).await;
        debug!("Terminal session ended (task={task_id})");
    })
}

async fn send_error(client: &mut WebSocket, message: String) {
    warn!("{message}");
    let _ = client.send(ClientMessage::Text(format!("Error: {message}").into())).await;
    let _ = client.close().await;
}

/// Open the runner leg and pipe frames both ways until either side
/// closes. With `handshake` set, the runner's first frame must be the
/// literal `CONNECTED` text before payload flows.
async fn proxy_session(mut client: WebSocket, runner_url: String, handshake: bool) {
    let runner = match connect_async(&runner_url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            send_error(&mut client, format!("Failed to connect to runner: {e}")).await;
            return;
        }
    };
    let (mut runner_tx, mut runner_rx) = runner.split();

    if handshake {
        let first = tokio::time::timeout(CONNECT_TIMEOUT, runner_rx.next()).await;
        match first {
            Ok(Some(Ok(RunnerMessage::Text(text)))) => {
                let text = text.to_string();
                if client.send(ClientMessage::Text(text.clone().into())).await.is_err() {
                    return;
                }
                if text != "CONNECTED" {
                    let _ = client.close().await;
                    return;
                }
            }
            Ok(Some(Ok(other))) => {
                // Binary before the handshake is unexpected but relayed.
                if let RunnerMessage::Binary(data) = other {
                    let _ = client.send(ClientMessage::Binary(data)).await;
                }
            }
            Ok(_) => {
                send_error(&mut client, "Runner closed before tunnel was established".into()).await;
                return;
            }
            Err(_) => {
                send_error(&mut client, "Timeout connecting to container tunnel".into()).await;
                return;
            }
        }
    }

    let (mut client_tx, mut client_rx) = client.split();

    let client_to_runner = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forwarded = match message {
                ClientMessage::Binary(data) => RunnerMessage::Binary(data),
                ClientMessage::Text(text) => RunnerMessage::Text(text.to_string().into()),
                ClientMessage::Close(_) => break,
                // Axum answers pings itself.
                _ => continue,
            };
            if runner_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    let runner_to_client = async {
        while let Some(Ok(message)) = runner_rx.next().await {
            let forwarded = match message {
                RunnerMessage::Binary(data) => ClientMessage::Binary(data),
                RunnerMessage::Text(text) => ClientMessage::Text(text.to_string().into()),
                RunnerMessage::Close(_) => break,
                _ => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    // Either side closing tears the whole session down; unsent frames
    // are dropped.
    tokio::select! {
        _ = client_to_runner => {}
        _ = runner_to_client => {}
    }
}
