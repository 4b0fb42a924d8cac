//! Session state — the unit of ownership.
//!
//! A `SessionHandle` owns every mutable field of one session: the hosted
//! process, the viewer set, the permission gate, and the status fields.
//! Only the session actor touches it; everyone else reads the `ArcSwap`
//! snapshot or posts commands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use gangway_protocol::{
    agent_chat_port, short_id, PermissionReply, SessionStatus, ServerMessage, ViewerRole,
};

use crate::permission::PermissionGate;
use crate::supervisor::{PtyProcess, SpawnSpec};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Outbound frames buffered per viewer before the viewer is dropped.
pub const VIEWER_BUFFER: usize = 128;

// Caps on the buffers that fill while the permission gate is open. The
// hosted process is blocked on the decision, so these stay tiny in practice.
const MAX_PENDING_INPUT: usize = 8 * 1024;
const MAX_PENDING_OUTPUT: usize = 256 * 1024;

/// A frame on its way to one viewer's websocket.
#[derive(Debug, Clone)]
pub enum ViewerFrame {
    /// JSON-serialized tagged message.
    Message(ServerMessage),
    /// Raw PTY output or an encoded download chunk.
    Binary(Bytes),
    /// Transport-level pong reply (opaque round-trip token).
    Pong(Bytes),
}

/// One attached viewer connection.
pub struct Viewer {
    pub id: u64,
    pub name: String,
    pub role: ViewerRole,
    tx: mpsc::Sender<ViewerFrame>,
}

/// Record of a finished hosted process.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub at: Instant,
}

/// Lock-free view of a session for status frames, the proxy gateway, the
/// reaper, and the sessions list.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub short_id: String,
    pub display_name: String,
    pub assistant: String,
    pub workdir: String,
    pub viewer_count: u32,
    pub cols: u16,
    pub rows: u16,
    pub base_port: Option<u16>,
    pub yolo: bool,
    pub yolo_supported: bool,
    pub exited: Option<ExitRecord>,
    pub last_activity: Instant,
    pub created_at: Instant,
}

impl SessionSnapshot {
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            base_port: self.base_port,
            agent_chat_port: self.base_port.and_then(agent_chat_port),
            workdir: self.workdir.clone(),
            viewer_count: self.viewer_count,
            cols: self.cols,
            rows: self.rows,
            assistant: self.assistant.clone(),
            display_name: self.display_name.clone(),
            short_id: self.short_id.clone(),
            yolo: self.yolo,
            yolo_supported: self.yolo_supported,
        }
    }
}

/// All mutable state of one session. Single-owner: the actor task.
pub struct SessionHandle {
    id: String,
    display_name: String,
    assistant: String,
    workdir: String,
    merge_target: Option<String>,
    spawn_spec: SpawnSpec,
    cols: u16,
    rows: u16,
    viewers: Vec<Viewer>,
    /// Tools allowed for the current incarnation.
    allowed_tools: HashSet<String>,
    /// Tools allowed across incarnations (allow-permanent decisions).
    sticky_allowed: HashSet<String>,
    skip_permissions: bool,
    base_port: Option<u16>,
    /// Prior incarnation ids, oldest first.
    incarnation_history: Vec<String>,
    pub gate: PermissionGate,
    /// Held hook responses, keyed by permission request id.
    pending_replies: HashMap<String, oneshot::Sender<PermissionReply>>,
    /// Viewer input buffered while the gate is open.
    pending_input: Vec<Bytes>,
    pending_input_len: usize,
    /// Hosted-process output buffered while the gate is open.
    pending_output: Vec<Bytes>,
    pending_output_len: usize,
    process: Option<PtyProcess>,
    exited: Option<ExitRecord>,
    last_activity: Instant,
    created_at: Instant,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionHandle {
    pub fn new(
        id: String,
        assistant: String,
        spawn_spec: SpawnSpec,
        merge_target: Option<String>,
    ) -> Self {
        let now = Instant::now();
        let workdir = spawn_spec.workdir.clone();
        let display_name = short_id(&id);
        let handle = Self {
            id,
            display_name,
            assistant,
            workdir,
            merge_target,
            spawn_spec,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            viewers: Vec::new(),
            allowed_tools: HashSet::new(),
            sticky_allowed: HashSet::new(),
            skip_permissions: false,
            base_port: None,
            incarnation_history: Vec::new(),
            gate: PermissionGate::new(),
            pending_replies: HashMap::new(),
            pending_input: Vec::new(),
            pending_input_len: 0,
            pending_output: Vec::new(),
            pending_output_len: 0,
            process: None,
            exited: None,
            last_activity: now,
            created_at: now,
            snapshot: Arc::new(ArcSwap::from_pointee(SessionSnapshot {
                id: String::new(),
                short_id: String::new(),
                display_name: String::new(),
                assistant: String::new(),
                workdir: String::new(),
                viewer_count: 0,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                base_port: None,
                yolo: false,
                yolo_supported: false,
                exited: None,
                last_activity: now,
                created_at: now,
            })),
        };
        handle.refresh_snapshot();
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn merge_target(&self) -> Option<&str> {
        self.merge_target.as_deref()
    }

    pub fn spawn_spec(&self) -> SpawnSpec {
        let mut spec = self.spawn_spec.clone();
        spec.cols = self.cols;
        spec.rows = self.rows;
        spec
    }

    /// YOLO mode is meaningless for a plain shell — there is no tool gate.
    pub fn yolo_supported(&self) -> bool {
        self.assistant != "shell"
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    // -- Process ownership --

    pub fn process(&self) -> Option<&PtyProcess> {
        self.process.as_ref()
    }

    /// Install a new incarnation, returning the previous one. The caller is
    /// responsible for terminating the returned handle. The outgoing
    /// incarnation id is recorded and the per-incarnation allowed-tool set
    /// resets to the sticky set.
    pub fn replace_process(&mut self, new: PtyProcess) -> Option<PtyProcess> {
        let old = self.process.replace(new);
        if let Some(old) = &old {
            self.incarnation_history.push(old.incarnation().to_string());
        }
        self.allowed_tools = self.sticky_allowed.clone();
        self.exited = None;
        self.touch();
        old
    }

    /// Remove and return the current process for teardown.
    pub fn take_process(&mut self) -> Option<PtyProcess> {
        self.process.take()
    }

    /// True when `incarnation` names the currently installed process.
    pub fn is_current_incarnation(&self, incarnation: &str) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.incarnation() == incarnation)
    }

    pub fn mark_exited(&mut self, code: Option<i32>) {
        self.exited = Some(ExitRecord {
            code,
            at: Instant::now(),
        });
        self.process = None;
    }

    pub fn exited(&self) -> Option<ExitRecord> {
        self.exited
    }

    pub fn incarnation_history(&self) -> &[String] {
        &self.incarnation_history
    }

    // -- Dimensions / identity --

    pub fn set_dimensions(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        self.touch();
    }

    pub fn set_display_name(&mut self, name: String) {
        self.display_name = name;
        self.touch();
    }

    pub fn set_base_port(&mut self, port: u16) {
        self.base_port = Some(port);
        self.touch();
    }

    pub fn base_port(&self) -> Option<u16> {
        self.base_port
    }

    // -- Permissions --

    pub fn skip_permissions(&self) -> bool {
        self.skip_permissions
    }

    pub fn set_skip_permissions(&mut self, enabled: bool) {
        self.skip_permissions = enabled;
        self.touch();
    }

    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        self.skip_permissions || self.allowed_tools.contains(tool)
    }

    pub fn allow_tool(&mut self, tool: &str, permanent: bool) {
        self.allowed_tools.insert(tool.to_string());
        if permanent {
            self.sticky_allowed.insert(tool.to_string());
        }
    }

    pub fn allowed_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.allowed_tools.iter().cloned().collect();
        tools.sort();
        tools
    }

    pub fn stash_reply(&mut self, request_id: String, reply: oneshot::Sender<PermissionReply>) {
        self.pending_replies.insert(request_id, reply);
    }

    pub fn take_reply(&mut self, request_id: &str) -> Option<oneshot::Sender<PermissionReply>> {
        self.pending_replies.remove(request_id)
    }

    // -- Gate buffers --

    pub fn buffer_input(&mut self, bytes: Bytes) {
        if self.pending_input_len + bytes.len() > MAX_PENDING_INPUT {
            warn!(
                component = "session",
                event = "session.pending_input_overflow",
                session_id = %self.id,
                "Dropping viewer input buffered during permission wait"
            );
            return;
        }
        self.pending_input_len += bytes.len();
        self.pending_input.push(bytes);
    }

    pub fn take_pending_input(&mut self) -> Vec<Bytes> {
        self.pending_input_len = 0;
        std::mem::take(&mut self.pending_input)
    }

    pub fn buffer_output(&mut self, bytes: Bytes) {
        if self.pending_output_len + bytes.len() > MAX_PENDING_OUTPUT {
            warn!(
                component = "session",
                event = "session.pending_output_overflow",
                session_id = %self.id,
                "Dropping hosted-process output buffered during permission wait"
            );
            return;
        }
        self.pending_output_len += bytes.len();
        self.pending_output.push(bytes);
    }

    pub fn take_pending_output(&mut self) -> Vec<Bytes> {
        self.pending_output_len = 0;
        std::mem::take(&mut self.pending_output)
    }

    // -- Viewers --

    pub fn attach_viewer(
        &mut self,
        id: u64,
        name: Option<String>,
        role: ViewerRole,
        tx: mpsc::Sender<ViewerFrame>,
    ) {
        let name = name.unwrap_or_else(|| format!("viewer-{id}"));
        self.viewers.push(Viewer { id, name, role, tx });
        self.touch();
    }

    /// Remove a viewer. Safe to call for an id that is already gone.
    pub fn detach_viewer(&mut self, id: u64) -> bool {
        let before = self.viewers.len();
        self.viewers.retain(|v| v.id != id);
        self.touch();
        self.viewers.len() != before
    }

    pub fn viewer_count(&self) -> u32 {
        self.viewers.len() as u32
    }

    pub fn viewer_name(&self, id: u64) -> Option<&str> {
        self.viewers
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.name.as_str())
    }

    pub fn viewer_tx(&self, id: u64) -> Option<mpsc::Sender<ViewerFrame>> {
        self.viewers
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.tx.clone())
    }

    /// Send a tagged message to every attached viewer. A viewer whose
    /// buffer is full or closed is dropped — the stream must not stall on a
    /// slow consumer. Returns the ids of dropped viewers.
    pub fn broadcast(&mut self, msg: ServerMessage) -> Vec<u64> {
        self.fan_out(|_| ViewerFrame::Message(msg.clone()), |_| true)
    }

    /// Send raw output bytes to every terminal viewer (observers receive
    /// tagged frames only). Returns the ids of dropped viewers.
    pub fn broadcast_output(&mut self, bytes: Bytes) -> Vec<u64> {
        self.fan_out(
            |_| ViewerFrame::Binary(bytes.clone()),
            |v| v.role == ViewerRole::Terminal,
        )
    }

    fn fan_out(
        &mut self,
        frame: impl Fn(&Viewer) -> ViewerFrame,
        include: impl Fn(&Viewer) -> bool,
    ) -> Vec<u64> {
        let mut dropped = Vec::new();
        self.viewers.retain(|viewer| {
            if !include(viewer) {
                return true;
            }
            match viewer.tx.try_send(frame(viewer)) {
                Ok(()) => true,
                Err(e) => {
                    debug!(
                        component = "session",
                        event = "session.viewer_dropped",
                        viewer_id = viewer.id,
                        error = %e,
                        "Viewer buffer unavailable, dropping viewer"
                    );
                    dropped.push(viewer.id);
                    false
                }
            }
        });
        dropped
    }

    // -- Snapshot --

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            base_port: self.base_port,
            agent_chat_port: self.base_port.and_then(agent_chat_port),
            workdir: self.workdir.clone(),
            viewer_count: self.viewer_count(),
            cols: self.cols,
            rows: self.rows,
            assistant: self.assistant.clone(),
            display_name: self.display_name.clone(),
            short_id: short_id(&self.id),
            yolo: self.skip_permissions,
            yolo_supported: self.yolo_supported(),
        }
    }

    pub fn snapshot_arc(&self) -> Arc<ArcSwap<SessionSnapshot>> {
        self.snapshot.clone()
    }

    pub fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(SessionSnapshot {
            id: self.id.clone(),
            short_id: short_id(&self.id),
            display_name: self.display_name.clone(),
            assistant: self.assistant.clone(),
            workdir: self.workdir.clone(),
            viewer_count: self.viewer_count(),
            cols: self.cols,
            rows: self.rows,
            base_port: self.base_port,
            yolo: self.skip_permissions,
            yolo_supported: self.yolo_supported(),
            exited: self.exited,
            last_activity: self.last_activity,
            created_at: self.created_at,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_protocol::ViewerRole;

    fn test_handle(assistant: &str) -> SessionHandle {
        SessionHandle::new(
            "0123456789abcdef".to_string(),
            assistant.to_string(),
            SpawnSpec {
                program: "sh".into(),
                args: vec![],
                env: vec![],
                workdir: "/tmp".into(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            },
            None,
        )
    }

    #[test]
    fn allowed_tools_and_yolo_gate_checks() {
        let mut handle = test_handle("claude");
        assert!(!handle.is_tool_allowed("Bash"));

        handle.allow_tool("Bash", false);
        assert!(handle.is_tool_allowed("Bash"));
        assert!(!handle.is_tool_allowed("Write"));

        handle.set_skip_permissions(true);
        assert!(handle.is_tool_allowed("Write"));
    }

    #[test]
    fn yolo_support_tracks_assistant() {
        assert!(test_handle("claude").yolo_supported());
        assert!(test_handle("codex").yolo_supported());
        assert!(!test_handle("shell").yolo_supported());
    }

    #[tokio::test]
    async fn slow_viewer_is_dropped_not_the_stream() {
        let mut handle = test_handle("shell");
        let (tx, _rx) = mpsc::channel(1);
        handle.attach_viewer(7, None, ViewerRole::Terminal, tx);

        // First frame fills the one-slot buffer; the second drops the viewer.
        let dropped = handle.broadcast_output(Bytes::from_static(b"a"));
        assert!(dropped.is_empty());
        let dropped = handle.broadcast_output(Bytes::from_static(b"b"));
        assert_eq!(dropped, vec![7]);
        assert_eq!(handle.viewer_count(), 0);
    }

    #[tokio::test]
    async fn observers_do_not_receive_raw_output() {
        let mut handle = test_handle("shell");
        let (term_tx, mut term_rx) = mpsc::channel(8);
        let (obs_tx, mut obs_rx) = mpsc::channel(8);
        handle.attach_viewer(1, None, ViewerRole::Terminal, term_tx);
        handle.attach_viewer(2, None, ViewerRole::Observer, obs_tx);

        handle.broadcast_output(Bytes::from_static(b"secret"));
        assert!(matches!(term_rx.try_recv(), Ok(ViewerFrame::Binary(_))));
        assert!(obs_rx.try_recv().is_err());

        // Tagged frames reach both roles.
        handle.broadcast(ServerMessage::Pong { token: "t".into() });
        assert!(matches!(term_rx.try_recv(), Ok(ViewerFrame::Message(_))));
        assert!(matches!(obs_rx.try_recv(), Ok(ViewerFrame::Message(_))));
    }

    #[test]
    fn status_reports_derived_chat_port_and_short_id() {
        let mut handle = test_handle("claude");
        handle.set_base_port(3000);
        let status = handle.status();
        assert_eq!(status.base_port, Some(3000));
        assert_eq!(status.agent_chat_port, Some(4000));
        assert_eq!(status.short_id, "01234567");
        assert!(status.yolo_supported);
    }

    #[test]
    fn gate_buffers_are_capped() {
        let mut handle = test_handle("claude");
        let chunk = Bytes::from(vec![0u8; 5 * 1024]);
        handle.buffer_input(chunk.clone());
        // Second chunk would exceed the input cap and is dropped.
        handle.buffer_input(chunk);
        let flushed = handle.take_pending_input();
        assert_eq!(flushed.len(), 1);
        assert!(handle.take_pending_input().is_empty());
    }
}
