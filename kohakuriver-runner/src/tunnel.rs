//! Runner half of the port-forward multiplexer, plus the terminal bridge.
//!
//! Every container runs a tunnel client that dials out to
//! `/ws/tunnel/{container_id}`; forward sessions from the host attach to
//! `/ws/forward/{container_id}/{port}` and share that single WebSocket,
//! demultiplexed by the frame header's `client_id`.

use crate::commands::CommandError;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use kohakuriver_models::tunnel::{FrameType, Proto, TunnelFrame};
use std::{
    collections::{HashMap, HashSet},
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};

const SESSION_CHANNEL_SIZE: usize = 256;

type SessionSender = mpsc::Sender<Vec<u8>>;

/// One connected in-container tunnel client.
#[derive(Clone)]
struct ContainerTunnel {
    to_container: mpsc::Sender<Vec<u8>>,
    sessions: Arc<Mutex<HashMap<u32, SessionSender>>>,
}

/// Tracks which containers have a live tunnel client.
#[derive(Default)]
pub struct TunnelRegistry {
    containers: Mutex<HashMap<String, ContainerTunnel>>,
}

impl TunnelRegistry {
    fn register(&self, container_id: &str, tunnel: ContainerTunnel) {
        self.containers.lock().expect("tunnel registry poisoned").insert(container_id.into(), tunnel);
    }

    fn unregister(&self, container_id: &str) {
        self.containers.lock().expect("tunnel registry poisoned").remove(container_id);
    }

    fn get(&self, container_id: &str) -> Option<ContainerTunnel> {
        self.containers.lock().expect("tunnel registry poisoned").get(container_id).cloned()
    }
}

/// `/ws/tunnel/{container_id}`: the tunnel client inside a container
/// connects out to this endpoint.
pub async fn handle_container_tunnel(registry: Arc<TunnelRegistry>, container_id: String, socket: WebSocket) {
    info!("Tunnel client connected for {container_id}");
    let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(SESSION_CHANNEL_SIZE);
    let sessions: Arc<Mutex<HashMap<u32, SessionSender>>> = Default::default();
    registry.register(&container_id, ContainerTunnel { to_container: sender, sessions: sessions.clone() });

    let (mut ws_tx, mut ws_rx) = socket.split();

    let outbound = async {
        while let Some(frame) = receiver.recv().await {
            if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    };

    let inbound = async {
        while let Some(Ok(message)) = ws_rx.next().await {
            let Message::Binary(data) = message else {
                continue;
            };
            let Ok(frame) = TunnelFrame::decode(&data) else {
                debug!("Dropping malformed frame from {container_id}");
                continue;
            };
            let session = sessions.lock().expect("sessions poisoned").get(&frame.client_id).cloned();
            match session {
                // Frames for a session nobody owns are dropped, never queued.
                None => debug!("No session for client_id {} on {container_id}", frame.client_id),
                Some(session) => {
                    let _ = session.try_send(data.to_vec());
                }
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
    registry.unregister(&container_id);
    info!("Tunnel client disconnected for {container_id}");
}

/// `/ws/forward/{container_id}/{port}`: one multiplexed forward session
/// from the host.
pub async fn handle_port_forward(
    registry: Arc<TunnelRegistry>,
    container_id: String,
    port: u16,
    proto: Proto,
    mut socket: WebSocket,
) {
    let Some(tunnel) = registry.get(&container_id) else {
        warn!("Forward requested but no tunnel client for {container_id}");
        let _ = socket.send(Message::Text("Error: tunnel client not connected".into())).await;
        let _ = socket.close().await;
        return;
    };
    if socket.send(Message::Text("CONNECTED".into())).await.is_err() {
        return;
    }
    info!("Forward session open: {container_id}:{port} ({proto:?})");

    let (session_tx, mut session_rx) = mpsc::channel::<Vec<u8>>(SESSION_CHANNEL_SIZE);
    let mut owned_clients: HashSet<u32> = HashSet::new();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                let Message::Binary(data) = message else {
                    continue;
                };
                let Ok(mut frame) = TunnelFrame::decode(&data) else {
                    debug!("Dropping malformed frame for {container_id}:{port}");
                    continue;
                };
                if frame.frame_type == FrameType::Connect {
                    // The path is authoritative for the target port.
                    frame.port = port;
                    frame.proto = proto;
                    owned_clients.insert(frame.client_id);
                    tunnel
                        .sessions
                        .lock()
                        .expect("sessions poisoned")
                        .insert(frame.client_id, session_tx.clone());
                }
                if frame.frame_type == FrameType::Close {
                    owned_clients.remove(&frame.client_id);
                    tunnel.sessions.lock().expect("sessions poisoned").remove(&frame.client_id);
                }
                if tunnel.to_container.send(frame.encode()).await.is_err() {
                    warn!("Tunnel client for {container_id} went away");
                    break;
                }
            }
            frame = session_rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Unregister whatever this session still owned.
    let mut sessions = tunnel.sessions.lock().expect("sessions poisoned");
    for client_id in owned_clients {
        sessions.remove(&client_id);
    }
    drop(sessions);
    debug!("Forward session closed: {container_id}:{port}");
}

/// `/ws/task/{task_id}/terminal`: a plain `docker exec` bridge. Text and
/// binary frames feed the shell's stdin; stdout/stderr stream back as
/// binary frames.
pub async fn handle_terminal(container_name: String, mut socket: WebSocket) {
    let child = tokio::process::Command::new("docker")
        .args(["exec", "-i", &container_name, "/bin/sh"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            let e = CommandError::Spawn { command: format!("docker exec -i {container_name} /bin/sh"), error: e };
            let _ = socket.send(Message::Text(format!("Error: {e}").into())).await;
            let _ = socket.close().await;
            return;
        }
    };
    let mut stdin = child.stdin.take().expect("stdin is piped");
    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let input = async {
        while let Some(Ok(message)) = ws_rx.next().await {
            let data = match message {
                Message::Binary(data) => data.to_vec(),
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            if stdin.write_all(&data).await.is_err() {
                break;
            }
        }
    };

    let output = async {
        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];
        loop {
            tokio::select! {
                read = stdout.read(&mut stdout_buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if ws_tx.send(Message::Binary(stdout_buf[..n].to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                read = stderr.read(&mut stderr_buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if ws_tx.send(Message::Binary(stderr_buf[..n].to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = input => {}
        _ = output => {}
    }
    let _ = child.kill().await;
}
