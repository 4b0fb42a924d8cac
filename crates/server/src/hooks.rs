//! HTTP intake for the hosted process's hooks.
//!
//! The hosted process reaches the session host over plain HTTP: its
//! permission hook POSTs a denied-tool-call report and blocks on the
//! response until a viewer decides; a startup hook announces the base
//! application port; agents can also ask the UI to open a URL. The target
//! URLs are injected into the hosted process's environment at spawn.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use gangway_protocol::PermissionReply;

use crate::debug_hub::HubCommand;
use crate::session_command::SessionCommand;
use crate::state::App;

#[derive(Debug, Deserialize)]
pub struct PermissionHookBody {
    pub tool: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
}

/// `POST /api/sessions/{id}/permission` — held open until a viewer
/// resolves the request. The hosted process is blocked on this response,
/// which is why pausing the session loses nothing.
pub async fn permission_hook_handler(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
    Json(body): Json<PermissionHookBody>,
) -> Response {
    let Some(entry) = app.registry.get(&session_id) else {
        warn!(
            component = "hooks",
            event = "hook.unknown_session",
            error = %crate::error::SessionError::NotFound(session_id.clone()),
            "Permission hook for unregistered session"
        );
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    entry
        .actor
        .send(SessionCommand::PermissionAsk {
            tool: body.tool.clone(),
            reason: body
                .reason
                .unwrap_or_else(|| format!("{} requires approval", body.tool)),
            tool_input: body.tool_input,
            reply: reply_tx,
        })
        .await;

    match reply_rx.await {
        Ok(reply) => Json(reply).into_response(),
        // Session died while the request was outstanding: deny.
        Err(_) => {
            warn!(
                component = "hooks",
                event = "hook.permission_orphaned",
                session_id = %session_id,
                tool = %body.tool,
                "Session went away before the request was decided"
            );
            Json(PermissionReply {
                allowed_tools: Vec::new(),
                skip_permissions: false,
            })
            .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PortHookBody {
    pub port: u16,
}

/// `POST /api/sessions/{id}/port` — the hosted process announces the base
/// application port its preview service listens on.
pub async fn port_hook_handler(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
    Json(body): Json<PortHookBody>,
) -> StatusCode {
    let Some(entry) = app.registry.get(&session_id) else {
        return StatusCode::NOT_FOUND;
    };
    info!(
        component = "hooks",
        event = "hook.port_announced",
        session_id = %session_id,
        port = body.port,
        "Hosted process announced its base port"
    );
    entry
        .actor
        .send(SessionCommand::AnnouncePort { port: body.port })
        .await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct OpenUrlBody {
    pub url: String,
}

/// `POST /api/sessions/{id}/open-url` — externally triggered open-URL
/// event, delivered to the session's designated UI observer.
pub async fn open_url_hook_handler(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
    Json(body): Json<OpenUrlBody>,
) -> StatusCode {
    let Some(entry) = app.registry.get(&session_id) else {
        return StatusCode::NOT_FOUND;
    };
    entry.debug.send(HubCommand::OpenUrl { url: body.url }).await;
    StatusCode::NO_CONTENT
}
