//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Offset from a session's base application port to its agent-chat sidecar.
pub const AGENT_CHAT_OFFSET: u16 = 1000;

/// Role of an attached viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    /// Full PTY viewer: receives raw terminal bytes and tagged frames.
    Terminal,
    /// Telemetry observer: tagged frames only, never raw bytes.
    Observer,
}

/// Addressing scheme for reaching a session's auxiliary services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    PortBased,
    PathBased,
}

/// What to do with the session's working tree when the session is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitAction {
    Discard,
    Merge,
}

/// Periodic status frame payload for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_chat_port: Option<u16>,
    pub workdir: String,
    pub viewer_count: u32,
    pub cols: u16,
    pub rows: u16,
    pub assistant: String,
    pub display_name: String,
    pub short_id: String,
    pub yolo: bool,
    pub yolo_supported: bool,
}

/// A tool invocation awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
}

/// Resolution of a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    /// Allow the tool for the remainder of this incarnation.
    AllowOnce,
    /// Allow the tool for this and future incarnations of the session.
    AllowAlways,
    Deny,
    /// Skip all remaining permission checks for this session.
    AllowAll,
}

/// Reply delivered to the hosted process's permission hook.
/// Field names are fixed by the hook contract, hence camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReply {
    pub allowed_tools: Vec<String>,
    pub skip_permissions: bool,
}

/// Worktree details attached to the exit frame when the working directory
/// is a linked git worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_target: Option<String>,
}

/// The four ports derived from one base application port.
///
/// `app` is announced by the hosted process; `agent_chat` is always
/// `app + 1000`; the two proxy listener ports add the configured offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPorts {
    pub app: u16,
    pub agent_chat: u16,
    pub app_proxy: u16,
    pub chat_proxy: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PortDeriveError {
    #[error("derived port exceeds 65535 (base {base}, offset {offset})")]
    OutOfRange { base: u16, offset: u16 },
    #[error("proxy offset {0} collides with a derived port")]
    OffsetCollision(u16),
}

impl ProxyPorts {
    /// Derive the full port chain from a base application port and the
    /// configured proxy offset. All four ports are pairwise distinct and
    /// within the valid range, or this returns an error.
    pub fn derive(base: u16, offset: u16) -> Result<Self, PortDeriveError> {
        if offset == 0 || offset == AGENT_CHAT_OFFSET {
            return Err(PortDeriveError::OffsetCollision(offset));
        }
        let agent_chat = base
            .checked_add(AGENT_CHAT_OFFSET)
            .ok_or(PortDeriveError::OutOfRange { base, offset })?;
        let app_proxy = base
            .checked_add(offset)
            .ok_or(PortDeriveError::OutOfRange { base, offset })?;
        let chat_proxy = agent_chat
            .checked_add(offset)
            .ok_or(PortDeriveError::OutOfRange { base, offset })?;
        Ok(Self {
            app: base,
            agent_chat,
            app_proxy,
            chat_proxy,
        })
    }
}

/// Agent-chat sidecar port for a given base application port, when it fits
/// in the port range.
pub fn agent_chat_port(base: u16) -> Option<u16> {
    base.checked_add(AGENT_CHAT_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_produces_pairwise_distinct_ports() {
        for base in [1024u16, 3000, 5173, 8080, 30000] {
            for offset in [1u16, 500, 3000, 20000] {
                let Ok(ports) = ProxyPorts::derive(base, offset) else {
                    continue;
                };
                let all = [ports.app, ports.agent_chat, ports.app_proxy, ports.chat_proxy];
                for i in 0..all.len() {
                    for j in (i + 1)..all.len() {
                        assert_ne!(all[i], all[j], "base={base} offset={offset}");
                    }
                }
            }
        }
    }

    #[test]
    fn derive_rejects_colliding_offsets() {
        assert_eq!(
            ProxyPorts::derive(3000, 0),
            Err(PortDeriveError::OffsetCollision(0))
        );
        assert_eq!(
            ProxyPorts::derive(3000, 1000),
            Err(PortDeriveError::OffsetCollision(1000))
        );
    }

    #[test]
    fn derive_rejects_overflow() {
        assert!(matches!(
            ProxyPorts::derive(65000, 3000),
            Err(PortDeriveError::OutOfRange { .. })
        ));
        assert!(matches!(
            ProxyPorts::derive(64000, 2000),
            Err(PortDeriveError::OutOfRange { .. })
        ));
    }

    #[test]
    fn derive_matches_documented_chain() {
        let ports = ProxyPorts::derive(3000, 3000).unwrap();
        assert_eq!(ports.app, 3000);
        assert_eq!(ports.agent_chat, 4000);
        assert_eq!(ports.app_proxy, 6000);
        assert_eq!(ports.chat_proxy, 7000);
    }

    #[test]
    fn permission_reply_uses_hook_field_names() {
        let reply = PermissionReply {
            allowed_tools: vec!["Bash".into()],
            skip_permissions: false,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("allowedTools"));
        assert!(json.contains("skipPermissions"));
    }
}
