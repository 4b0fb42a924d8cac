//! Server → Client messages (PTY channel text frames)

use serde::{Deserialize, Serialize};

use crate::types::{PermissionRequest, SessionStatus, WorktreeInfo};

/// Tagged frames sent from the session host to a viewer. Raw terminal output
/// and file downloads travel as binary frames (see [`crate::frames`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Periodic status frame, also emitted immediately on attach/detach/
    /// resize/rename so UIs stay consistent without polling.
    Status { status: SessionStatus },

    /// Echo of a client ping token.
    Pong { token: String },

    /// A tool call is paused awaiting a human decision.
    PermissionRequested { request: PermissionRequest },

    /// The outstanding request was resolved (by this viewer or another).
    PermissionResolved { request_id: String },

    /// Chat text from another viewer.
    Chat { from: String, text: String },

    /// The hosted process exited. Worktree details are present when the
    /// working directory is a linked git worktree, for the exit-action UI.
    SessionExit {
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        worktree: Option<WorktreeInfo>,
    },

    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let msg = ServerMessage::Status {
            status: SessionStatus {
                base_port: Some(3000),
                agent_chat_port: Some(4000),
                workdir: "/work/app".into(),
                viewer_count: 2,
                cols: 80,
                rows: 24,
                assistant: "claude".into(),
                display_name: "feature-branch".into(),
                short_id: "ab12cd34".into(),
                yolo: false,
                yolo_supported: true,
            },
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let reparsed: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerMessage::Status { status } => {
                assert_eq!(status.base_port, Some(3000));
                assert_eq!(status.agent_chat_port, Some(4000));
                assert_eq!(status.viewer_count, 2);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn session_exit_omits_absent_worktree() {
        let msg = ServerMessage::SessionExit {
            code: Some(0),
            worktree: None,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(!json.contains("worktree"));

        let msg = ServerMessage::SessionExit {
            code: Some(1),
            worktree: Some(WorktreeInfo {
                path: "/work/.worktrees/fix".into(),
                branch: "fix".into(),
                merge_target: Some("main".into()),
            }),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let reparsed: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerMessage::SessionExit { code, worktree } => {
                assert_eq!(code, Some(1));
                assert_eq!(worktree.unwrap().merge_target.as_deref(), Some("main"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
