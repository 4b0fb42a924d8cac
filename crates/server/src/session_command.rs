//! Commands sent to a session actor from websocket/hook/proxy callers.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use gangway_protocol::{ExitAction, PermissionReply, PermissionRequest, SessionStatus, ViewerRole};

use crate::session::ViewerFrame;

/// Everything a session actor can be asked to do. Queries carry a oneshot
/// reply slot; the rest are fire-and-forget. Commands are processed strictly
/// in arrival order — that single total order per session is what makes
/// attach/detach, permission resolution, and process replacement race-free.
pub enum SessionCommand {
    // -- Viewer lifecycle --
    Attach {
        name: Option<String>,
        role: ViewerRole,
        tx: mpsc::Sender<ViewerFrame>,
        reply: oneshot::Sender<AttachReply>,
    },
    Detach {
        viewer_id: u64,
    },

    // -- Viewer traffic --
    Input {
        bytes: Bytes,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Rename {
        name: String,
    },
    SetYolo {
        enabled: bool,
    },
    Chat {
        viewer_id: u64,
        text: String,
    },
    Upload {
        viewer_id: u64,
        name: String,
        data: Bytes,
    },
    Download {
        viewer_id: u64,
        path: String,
    },

    // -- Permission gate --
    /// A denied-tool-call report from the hosted process's permission hook.
    /// The reply is held open until a viewer resolves the request.
    PermissionAsk {
        tool: String,
        reason: String,
        tool_input: Option<serde_json::Value>,
        reply: oneshot::Sender<PermissionReply>,
    },
    /// A viewer's resolution of the outstanding request.
    PermissionResponse {
        request_id: String,
        allowed_tools: Vec<String>,
        skip_permissions: bool,
        remember: bool,
    },

    // -- Hosted process --
    /// Spawn the first incarnation. Sent once, right after creation.
    StartProcess,
    /// Replace the hosted process with a fresh incarnation.
    Restart,
    /// The hosted process announced its base application port.
    AnnouncePort {
        port: u16,
    },
    /// Output from the PTY reader, tagged with its incarnation.
    PtyOutput {
        incarnation: String,
        bytes: Bytes,
    },
    /// Exit event, exactly once per incarnation.
    PtyExit {
        incarnation: String,
        code: Option<i32>,
    },

    // -- Status / teardown --
    /// Emit a status frame to every viewer (ticker and transports use this).
    BroadcastStatus,
    GetStatus {
        reply: oneshot::Sender<SessionStatus>,
    },
    /// Viewer-initiated teardown; merge execution happens client-side.
    CloseSession {
        action: ExitAction,
    },
    /// Terminate the hosted process and stop the actor loop.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of an `Attach`
pub struct AttachReply {
    pub viewer_id: u64,
    /// The currently outstanding permission request, if any, so a viewer
    /// attaching mid-decision can render the dialog.
    pub pending_permission: Option<PermissionRequest>,
}
