//! Client → Server messages (PTY channel text frames)

use serde::{Deserialize, Serialize};

use crate::types::ExitAction;

/// Tagged frames sent from a viewer to the session host. Raw terminal input
/// and file uploads travel as binary frames (see [`crate::frames`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// New terminal dimensions for the hosted process.
    Resize { cols: u16, rows: u16 },

    /// Round-trip liveness check; the token is echoed back verbatim.
    Ping { token: String },

    /// Rename the session's display name.
    Rename { name: String },

    /// Toggle YOLO mode (skip all permission checks).
    SetYolo { enabled: bool },

    /// Chat text relayed to every attached viewer.
    Chat { text: String },

    /// Resolution of an outstanding permission request.
    PermissionResponse {
        request_id: String,
        #[serde(default)]
        allowed_tools: Vec<String>,
        #[serde(default)]
        skip_permissions: bool,
        /// Remember allowed tools across incarnations of this session.
        #[serde(default)]
        remember: bool,
    },

    /// Request a file from the session's working directory.
    DownloadFile { path: String },

    /// Replace the hosted process with a fresh incarnation.
    Restart,

    /// Tear the session down; merge-strategy execution happens client-side.
    CloseSession { action: ExitAction },
}
