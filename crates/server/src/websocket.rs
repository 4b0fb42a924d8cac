//! WebSocket transports: the PTY channel (one connection per viewer) and
//! the debug channel endpoints.
//!
//! Each connection gets an outbound pump task fed by a bounded mpsc
//! channel; the inbound loop decodes text frames as tagged JSON and binary
//! frames through the frame codec, then posts commands to the session
//! actor. The transport holds no session state of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use gangway_protocol::frames::{decode_client_frame, ClientFrame};
use gangway_protocol::{ClientMessage, ServerMessage, ViewerRole};

use crate::debug_hub::{DebugHubHandle, DebugRole, HubCommand};
use crate::registry::SessionEntry;
use crate::session::{SessionHandle, ViewerFrame, VIEWER_BUFFER};
use crate::session_actor::{ActorContext, SessionActorHandle};
use crate::session_command::SessionCommand;
use crate::state::App;
use crate::supervisor::SpawnSpec;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
pub struct AttachParams {
    /// `terminal` (default) or `observer`.
    pub role: Option<String>,
    /// Viewer display name.
    pub name: Option<String>,
    /// Assistant identity for a new session (`claude`, `codex`, `shell`).
    pub agent: Option<String>,
    /// Explicit command line override for a new session.
    pub cmd: Option<String>,
    /// Working directory for a new session.
    pub workdir: Option<String>,
    /// Merge-target branch when the workdir is a git worktree.
    pub merge_target: Option<String>,
}

/// PTY channel upgrade handler: `GET /ws/{session_id}`.
pub async fn pty_ws_handler(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
    Query(params): Query<AttachParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pty_socket(socket, app, session_id, params))
}

/// Build a new session for its first attach.
fn build_session(app: &Arc<App>, session_id: &str, params: &AttachParams) -> SessionEntry {
    let assistant = params
        .agent
        .clone()
        .unwrap_or_else(|| app.config.default_assistant.clone());
    let workdir = params
        .workdir
        .clone()
        .unwrap_or_else(|| app.config.default_workdir.clone());
    let (program, args) = SpawnSpec::command_for(&assistant, params.cmd.as_deref());

    let api_base = format!("http://127.0.0.1:{}/api/sessions/{session_id}", app.config.port);
    let spec = SpawnSpec {
        program,
        args,
        env: vec![
            ("GANGWAY_SESSION_ID".into(), session_id.to_string()),
            ("GANGWAY_PERMISSION_URL".into(), format!("{api_base}/permission")),
            ("GANGWAY_PORT_URL".into(), format!("{api_base}/port")),
        ],
        workdir,
        cols: crate::session::DEFAULT_COLS,
        rows: crate::session::DEFAULT_ROWS,
    };

    let handle = SessionHandle::new(
        session_id.to_string(),
        assistant,
        spec,
        params.merge_target.clone(),
    );
    let ctx = ActorContext {
        gateway: app.gateway.clone(),
        terminate_grace: app.config.terminate_grace,
    };
    SessionEntry {
        actor: SessionActorHandle::spawn(handle, ctx),
        debug: DebugHubHandle::spawn(session_id.to_string()),
    }
}

async fn handle_pty_socket(
    socket: WebSocket,
    app: Arc<App>,
    session_id: String,
    params: AttachParams,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %session_id,
        "PTY channel opened"
    );

    let (entry, created) = app
        .registry
        .get_or_create(&session_id, || build_session(&app, &session_id, &params));
    if created {
        entry.actor.send(SessionCommand::StartProcess).await;
    }
    let actor = entry.actor.clone();

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound pump: viewer frames → websocket. The channel is the viewer's
    // bounded buffer; when it backs up the actor drops this viewer.
    let (viewer_tx, mut viewer_rx) = mpsc::channel::<ViewerFrame>(VIEWER_BUFFER);
    let send_task = tokio::spawn(async move {
        while let Some(frame) = viewer_rx.recv().await {
            let result = match frame {
                ViewerFrame::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                ViewerFrame::Binary(bytes) => ws_tx.send(Message::Binary(bytes)).await,
                ViewerFrame::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Attach as a viewer; the reply carries our id and any outstanding
    // permission request so a mid-decision attach can render the dialog.
    let role = match params.role.as_deref() {
        Some("observer") => ViewerRole::Observer,
        _ => ViewerRole::Terminal,
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    actor
        .send(SessionCommand::Attach {
            name: params.name.clone(),
            role,
            tx: viewer_tx.clone(),
            reply: reply_tx,
        })
        .await;
    let Ok(attach) = reply_rx.await else {
        warn!(
            component = "websocket",
            event = "ws.attach_failed",
            connection_id = conn_id,
            session_id = %session_id,
            "Session actor gone during attach"
        );
        send_task.abort();
        return;
    };
    let viewer_id = attach.viewer_id;
    if let Some(request) = attach.pending_permission {
        let _ = viewer_tx
            .send(ViewerFrame::Message(ServerMessage::PermissionRequested {
                request,
            }))
            .await;
    }

    // Inbound loop.
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.message.parse_failed",
                            connection_id = conn_id,
                            error = %e,
                            payload_bytes = text.len(),
                            "Failed to parse client message"
                        );
                        let _ = viewer_tx
                            .send(ViewerFrame::Message(ServerMessage::Error {
                                code: "parse_error".into(),
                                message: e.to_string(),
                            }))
                            .await;
                        continue;
                    }
                };
                let closing = handle_client_message(
                    client_msg,
                    &actor,
                    &app,
                    &session_id,
                    viewer_id,
                    &viewer_tx,
                )
                .await;
                if closing {
                    break;
                }
            }
            Ok(Message::Binary(frame)) => match decode_client_frame(frame) {
                Ok(ClientFrame::Input(bytes)) => {
                    actor.send(SessionCommand::Input { bytes }).await;
                }
                Ok(ClientFrame::Upload { name, data }) => {
                    actor
                        .send(SessionCommand::Upload {
                            viewer_id,
                            name,
                            data,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.frame.decode_failed",
                        connection_id = conn_id,
                        error = %e,
                        "Failed to decode binary frame"
                    );
                    let _ = viewer_tx
                        .send(ViewerFrame::Message(ServerMessage::Error {
                            code: "bad_frame".into(),
                            message: e.to_string(),
                        }))
                        .await;
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = viewer_tx.send(ViewerFrame::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    // Detach is itself a command, processed in order — no output is ever
    // delivered to an already-removed viewer.
    actor.send(SessionCommand::Detach { viewer_id }).await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %session_id,
        "PTY channel closed"
    );
    send_task.abort();
}

/// Dispatch one tagged client frame. Returns true when the connection
/// should close (session teardown).
async fn handle_client_message(
    msg: ClientMessage,
    actor: &SessionActorHandle,
    app: &Arc<App>,
    session_id: &str,
    viewer_id: u64,
    viewer_tx: &mpsc::Sender<ViewerFrame>,
) -> bool {
    match msg {
        ClientMessage::Resize { cols, rows } => {
            actor.send(SessionCommand::Resize { cols, rows }).await;
        }
        ClientMessage::Ping { token } => {
            let _ = viewer_tx
                .send(ViewerFrame::Message(ServerMessage::Pong { token }))
                .await;
        }
        ClientMessage::Rename { name } => {
            actor.send(SessionCommand::Rename { name }).await;
        }
        ClientMessage::SetYolo { enabled } => {
            actor.send(SessionCommand::SetYolo { enabled }).await;
        }
        ClientMessage::Chat { text } => {
            actor.send(SessionCommand::Chat { viewer_id, text }).await;
        }
        ClientMessage::PermissionResponse {
            request_id,
            allowed_tools,
            skip_permissions,
            remember,
        } => {
            actor
                .send(SessionCommand::PermissionResponse {
                    request_id,
                    allowed_tools,
                    skip_permissions,
                    remember,
                })
                .await;
        }
        ClientMessage::DownloadFile { path } => {
            actor.send(SessionCommand::Download { viewer_id, path }).await;
        }
        ClientMessage::Restart => {
            actor.send(SessionCommand::Restart).await;
        }
        ClientMessage::CloseSession { action } => {
            // Remove first so no new viewer attaches to a dying session.
            app.registry.remove(session_id);
            actor.send(SessionCommand::CloseSession { action }).await;
            return true;
        }
    }
    false
}

/// Debug channel upgrade handler: `GET /ws/{session_id}/debug/{role}`.
pub async fn debug_ws_handler(
    State(app): State<Arc<App>>,
    Path((session_id, role)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let role = match role.as_str() {
        "ui" => DebugRole::UiObserver,
        "iframe" => DebugRole::Iframe,
        "agent" => DebugRole::Agent,
        _ => return (StatusCode::NOT_FOUND, "unknown debug role").into_response(),
    };
    let Some(entry) = app.registry.get(&session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let hub = entry.debug.clone();
    ws.on_upgrade(move |socket| serve_debug_socket(socket, hub, role))
}

/// Pump one debug channel connection against the session's hub. Shared by
/// the main-router endpoints and both proxy front ends, which is what makes
/// the two addressing schemes land on the same hub instance.
pub async fn serve_debug_socket(socket: WebSocket, hub: DebugHubHandle, role: DebugRole) {
    let (hub_tx, mut hub_rx) = DebugHubHandle::subscriber_channel();
    let Some(client_id) = hub.subscribe(role, hub_tx).await else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(text) = hub_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => {
                hub.send(HubCommand::Publish {
                    client_id,
                    text: text.to_string(),
                })
                .await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.send(HubCommand::Unsubscribe { client_id }).await;
    send_task.abort();
}
