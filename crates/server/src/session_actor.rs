//! Session actor — owns a SessionHandle and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle`, which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free reads go through `ArcSwap`.
//! Because every mutation flows through the one queue, attach/detach,
//! permission resolution, and process replacement observe a single total
//! order and cannot interleave partially.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use gangway_protocol::frames::encode_download;
use gangway_protocol::{
    PermissionDecision, PermissionReply, PermissionRequest, ProxyPorts, ServerMessage,
};

use crate::permission::Resolution;
use crate::proxy::ProxyGateway;
use crate::session::{SessionHandle, SessionSnapshot, ViewerFrame};
use crate::session_command::{AttachReply, SessionCommand};
use crate::supervisor::PtyProcess;

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Ambient dependencies the actor needs for command processing.
#[derive(Clone)]
pub struct ActorContext {
    pub gateway: Arc<ProxyGateway>,
    pub terminate_grace: Duration,
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionActorHandle {
    /// Spawn the actor task and its status ticker, returning a handle.
    pub fn spawn(handle: SessionHandle, ctx: ActorContext) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        let snapshot = handle.snapshot_arc();
        let id = handle.id().to_string();
        handle.refresh_snapshot();

        let self_tx = command_tx.clone();
        tokio::spawn(actor_loop(handle, command_rx, self_tx, ctx));

        let ticker_tx = command_tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATUS_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                if ticker_tx.send(SessionCommand::BroadcastStatus).await.is_err() {
                    break;
                }
            }
        });

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Get a clone of the command sender (for passing to spawned tasks).
    pub fn command_tx(&self) -> mpsc::Sender<SessionCommand> {
        self.command_tx.clone()
    }
}

async fn actor_loop(
    mut handle: SessionHandle,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::Sender<SessionCommand>,
    ctx: ActorContext,
) {
    while let Some(cmd) = command_rx.recv().await {
        let stop = handle_session_command(cmd, &mut handle, &self_tx, &ctx).await;
        // Unconditional snapshot refresh — the ArcSwap is always current
        // regardless of which command ran above.
        handle.refresh_snapshot();
        if stop {
            break;
        }
    }
    debug!(
        component = "session_actor",
        session_id = %handle.id(),
        "Session actor stopped"
    );
}

/// Process one command against the session. Returns true when the actor
/// loop should stop.
pub async fn handle_session_command(
    cmd: SessionCommand,
    handle: &mut SessionHandle,
    self_tx: &mpsc::Sender<SessionCommand>,
    ctx: &ActorContext,
) -> bool {
    match cmd {
        // -- Viewer lifecycle --
        SessionCommand::Attach {
            name,
            role,
            tx,
            reply,
        } => {
            let viewer_id = NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed);
            handle.attach_viewer(viewer_id, name, role, tx);
            let _ = reply.send(AttachReply {
                viewer_id,
                pending_permission: handle.gate.current().cloned(),
            });
            // A reattach during the exit-grace window still needs to learn
            // the process is gone.
            if let Some(exit) = handle.exited() {
                let worktree = crate::git::worktree_info(
                    handle.workdir(),
                    handle.merge_target().map(String::from),
                )
                .await;
                if let Some(viewer) = handle.viewer_tx(viewer_id) {
                    let _ = viewer.try_send(ViewerFrame::Message(ServerMessage::SessionExit {
                        code: exit.code,
                        worktree,
                    }));
                }
            }
            broadcast_status(handle);
        }
        SessionCommand::Detach { viewer_id } => {
            if handle.detach_viewer(viewer_id) {
                broadcast_status(handle);
            }
        }

        // -- Viewer traffic --
        SessionCommand::Input { bytes } => {
            handle.touch();
            if handle.gate.is_awaiting() {
                handle.buffer_input(bytes);
            } else if let Some(process) = handle.process() {
                process.write(bytes).await;
            }
        }
        SessionCommand::Resize { cols, rows } => {
            handle.set_dimensions(cols, rows);
            if let Some(process) = handle.process() {
                process.resize(cols, rows);
            }
            broadcast_status(handle);
        }
        SessionCommand::Rename { name } => {
            handle.set_display_name(name);
            broadcast_status(handle);
        }
        SessionCommand::SetYolo { enabled } => {
            if !handle.yolo_supported() {
                debug!(
                    component = "session",
                    session_id = %handle.id(),
                    "YOLO toggle ignored for assistant without a tool gate"
                );
                return false;
            }
            handle.set_skip_permissions(enabled);
            if enabled {
                // Everything outstanding resolves as allowed.
                resolve_all_outstanding(handle);
                flush_gate_buffers(handle).await;
            }
            broadcast_status(handle);
        }
        SessionCommand::Chat { viewer_id, text } => {
            let from = handle
                .viewer_name(viewer_id)
                .unwrap_or("viewer")
                .to_string();
            handle.broadcast(ServerMessage::Chat { from, text });
        }
        SessionCommand::Upload {
            viewer_id,
            name,
            data,
        } => {
            handle_upload(handle, viewer_id, &name, data).await;
        }
        SessionCommand::Download { viewer_id, path } => {
            handle_download(handle, viewer_id, path);
        }

        // -- Permission gate --
        SessionCommand::PermissionAsk {
            tool,
            reason,
            tool_input,
            reply,
        } => {
            handle.touch();
            if handle.is_tool_allowed(&tool) {
                let _ = reply.send(PermissionReply {
                    allowed_tools: handle.allowed_tools(),
                    skip_permissions: handle.skip_permissions(),
                });
                return false;
            }
            let request = PermissionRequest {
                id: gangway_protocol::new_id(),
                tool,
                reason,
                tool_input,
            };
            handle.stash_reply(request.id.clone(), reply);
            let became_current = handle.gate.submit(request.clone());
            if became_current {
                info!(
                    component = "session",
                    event = "permission.requested",
                    session_id = %handle.id(),
                    tool = %request.tool,
                    request_id = %request.id,
                    "Tool call paused awaiting a decision"
                );
                handle.broadcast(ServerMessage::PermissionRequested { request });
            } else {
                debug!(
                    component = "session",
                    event = "permission.queued",
                    session_id = %handle.id(),
                    request_id = %request.id,
                    "Permission request queued behind the current one"
                );
            }
        }
        SessionCommand::PermissionResponse {
            request_id,
            allowed_tools,
            skip_permissions,
            remember,
        } => {
            match handle.gate.resolve(&request_id) {
                Resolution::Stale => {
                    // A response naming a non-current request is a no-op.
                    let err = crate::error::SessionError::StaleRequest(request_id);
                    debug!(
                        component = "session",
                        event = "permission.stale_response",
                        session_id = %handle.id(),
                        error = %err,
                        "Ignoring stale permission response"
                    );
                }
                Resolution::Applied { request, next } => {
                    if skip_permissions {
                        handle.set_skip_permissions(true);
                    }
                    for tool in &allowed_tools {
                        handle.allow_tool(tool, remember);
                    }
                    let decision = if skip_permissions {
                        PermissionDecision::AllowAll
                    } else if allowed_tools.contains(&request.tool) {
                        if remember {
                            PermissionDecision::AllowAlways
                        } else {
                            PermissionDecision::AllowOnce
                        }
                    } else {
                        PermissionDecision::Deny
                    };
                    info!(
                        component = "session",
                        event = "permission.resolved",
                        session_id = %handle.id(),
                        request_id = %request.id,
                        tool = %request.tool,
                        decision = ?decision,
                        "Permission request resolved"
                    );
                    if let Some(reply) = handle.take_reply(&request.id) {
                        let _ = reply.send(PermissionReply {
                            allowed_tools: handle.allowed_tools(),
                            skip_permissions: handle.skip_permissions(),
                        });
                    }
                    handle.broadcast(ServerMessage::PermissionResolved {
                        request_id: request.id,
                    });
                    match next {
                        Some(promoted) => {
                            handle.broadcast(ServerMessage::PermissionRequested {
                                request: promoted,
                            });
                        }
                        None => flush_gate_buffers(handle).await,
                    }
                    if handle.skip_permissions() {
                        resolve_all_outstanding(handle);
                        flush_gate_buffers(handle).await;
                    }
                    broadcast_status(handle);
                }
            }
        }

        // -- Hosted process --
        SessionCommand::StartProcess => {
            if handle.process().is_some() {
                return false;
            }
            spawn_incarnation(handle, self_tx, ctx, false).await;
            broadcast_status(handle);
        }
        SessionCommand::Restart => {
            spawn_incarnation(handle, self_tx, ctx, true).await;
            broadcast_status(handle);
        }
        SessionCommand::AnnouncePort { port } => {
            let unchanged = handle.base_port() == Some(port);
            handle.set_base_port(port);
            if unchanged {
                // Re-announcement of the same port; listeners already exist.
                return false;
            }
            match ProxyPorts::derive(port, ctx.gateway.offset()) {
                Ok(ports) => {
                    ctx.gateway
                        .clone()
                        .ensure_session_listeners(handle.id(), ports)
                        .await;
                }
                Err(e) => {
                    warn!(
                        component = "session",
                        event = "session.port_derive_failed",
                        session_id = %handle.id(),
                        port,
                        error = %e,
                        "Announced port has no valid proxy chain"
                    );
                }
            }
            broadcast_status(handle);
        }
        SessionCommand::PtyOutput { incarnation, bytes } => {
            if !handle.is_current_incarnation(&incarnation) {
                return false;
            }
            handle.touch();
            if handle.gate.is_awaiting() {
                handle.buffer_output(bytes);
            } else {
                let dropped = handle.broadcast_output(bytes);
                if !dropped.is_empty() {
                    broadcast_status(handle);
                }
            }
        }
        SessionCommand::PtyExit { incarnation, code } => {
            if !handle.is_current_incarnation(&incarnation) {
                // A replaced incarnation finishing its terminate is expected.
                debug!(
                    component = "session",
                    session_id = %handle.id(),
                    incarnation = %incarnation,
                    "Exit event from a previous incarnation"
                );
                return false;
            }
            info!(
                component = "session",
                event = "session.process_exited",
                session_id = %handle.id(),
                code,
                "Hosted process exited"
            );
            handle.mark_exited(code);
            deny_outstanding(handle);
            let worktree = crate::git::worktree_info(
                handle.workdir(),
                handle.merge_target().map(String::from),
            )
            .await;
            handle.broadcast(ServerMessage::SessionExit { code, worktree });
            broadcast_status(handle);
        }

        // -- Status / teardown --
        SessionCommand::BroadcastStatus => {
            broadcast_status(handle);
        }
        SessionCommand::GetStatus { reply } => {
            let _ = reply.send(handle.status());
        }
        SessionCommand::CloseSession { action } => {
            info!(
                component = "session",
                event = "session.closed",
                session_id = %handle.id(),
                action = ?action,
                "Session closed by viewer"
            );
            let worktree = crate::git::worktree_info(
                handle.workdir(),
                handle.merge_target().map(String::from),
            )
            .await;
            let code = handle.exited().and_then(|e| e.code);
            handle.broadcast(ServerMessage::SessionExit { code, worktree });
            shutdown_session(handle, ctx).await;
            return true;
        }
        SessionCommand::Shutdown { reply } => {
            shutdown_session(handle, ctx).await;
            let _ = reply.send(());
            return true;
        }
    }
    false
}

fn broadcast_status(handle: &mut SessionHandle) {
    let status = handle.status();
    handle.broadcast(ServerMessage::Status { status });
}

/// Spawn a new incarnation. With `replace`, the previous process (if any)
/// is swapped out and terminated in the background; without it, a spawn
/// failure is fatal to the session.
async fn spawn_incarnation(
    handle: &mut SessionHandle,
    self_tx: &mpsc::Sender<SessionCommand>,
    ctx: &ActorContext,
    replace: bool,
) {
    match PtyProcess::spawn(&handle.spawn_spec(), self_tx.clone()) {
        Ok(process) => {
            info!(
                component = "session",
                event = "session.process_started",
                session_id = %handle.id(),
                incarnation = %process.incarnation(),
                replace,
                "Hosted process started"
            );
            let old = handle.replace_process(process);
            if let Some(old) = old {
                debug!(
                    component = "session",
                    session_id = %handle.id(),
                    prior_incarnations = handle.incarnation_history().len(),
                    "Replaced incarnation queued for termination"
                );
                let grace = ctx.terminate_grace;
                tokio::spawn(async move {
                    old.terminate(grace).await;
                });
            }
        }
        Err(e) => {
            error!(
                component = "session",
                event = "session.spawn_failed",
                session_id = %handle.id(),
                error = %e,
                "Failed to start hosted process"
            );
            handle.broadcast(ServerMessage::Error {
                code: "spawn_failed".into(),
                message: e.to_string(),
            });
            if !replace {
                // Fatal to the session; the reaper collects it after the
                // grace window.
                handle.mark_exited(None);
            }
        }
    }
}

/// Resolve every outstanding request as allowed (YOLO flip).
fn resolve_all_outstanding(handle: &mut SessionHandle) {
    while let Some(current) = handle.gate.current().cloned() {
        match handle.gate.resolve(&current.id) {
            Resolution::Applied { request, .. } => {
                if let Some(reply) = handle.take_reply(&request.id) {
                    let _ = reply.send(PermissionReply {
                        allowed_tools: handle.allowed_tools(),
                        skip_permissions: true,
                    });
                }
                handle.broadcast(ServerMessage::PermissionResolved {
                    request_id: request.id,
                });
            }
            Resolution::Stale => break,
        }
    }
}

/// Answer every outstanding request with a denial (process gone).
fn deny_outstanding(handle: &mut SessionHandle) {
    for request in handle.gate.clear() {
        if let Some(reply) = handle.take_reply(&request.id) {
            let _ = reply.send(PermissionReply {
                allowed_tools: handle.allowed_tools(),
                skip_permissions: false,
            });
        }
        handle.broadcast(ServerMessage::PermissionResolved {
            request_id: request.id,
        });
    }
}

/// Flush input/output buffered while the gate was open. Output first so
/// viewers see the pre-pause bytes before their own echoed keystrokes.
async fn flush_gate_buffers(handle: &mut SessionHandle) {
    if handle.gate.is_awaiting() {
        return;
    }
    for bytes in handle.take_pending_output() {
        handle.broadcast_output(bytes);
    }
    let pending = handle.take_pending_input();
    if let Some(process) = handle.process() {
        for bytes in pending {
            process.write(bytes).await;
        }
    }
}

async fn shutdown_session(handle: &mut SessionHandle, ctx: &ActorContext) {
    if let Some(process) = handle.take_process() {
        process.terminate(ctx.terminate_grace).await;
    }
    deny_outstanding(handle);
    ctx.gateway.drop_session_listeners(handle.id());
}

/// Resolve a session-relative path, rejecting traversal and absolute paths.
fn sanitize_rel_path(workdir: &str, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    if rel.as_os_str().is_empty() || rel.is_absolute() {
        return None;
    }
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(Path::new(workdir).join(rel))
}

async fn handle_upload(handle: &mut SessionHandle, viewer_id: u64, name: &str, data: Bytes) {
    let Some(path) = sanitize_rel_path(handle.workdir(), name) else {
        send_viewer_error(handle, viewer_id, "bad_upload_path", "invalid upload path");
        return;
    };
    if data.is_empty() {
        // Empty chunk marks end-of-file; nothing to write.
        return;
    }
    // Chunks append in command order — uploads stay inside the actor so a
    // multi-frame transfer cannot interleave out of order.
    let result = async {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = result {
        warn!(
            component = "session",
            event = "session.upload_failed",
            session_id = %handle.id(),
            name,
            error = %e,
            "File upload failed"
        );
        send_viewer_error(handle, viewer_id, "upload_failed", &e.to_string());
    } else {
        handle.touch();
    }
}

fn handle_download(handle: &mut SessionHandle, viewer_id: u64, path: String) {
    let Some(tx) = handle.viewer_tx(viewer_id) else {
        return;
    };
    let Some(full) = sanitize_rel_path(handle.workdir(), &path) else {
        send_viewer_error(handle, viewer_id, "bad_download_path", "invalid download path");
        return;
    };
    // Streaming a file does not touch session state; run it off-actor so a
    // large download never stalls the command queue.
    tokio::spawn(async move {
        match tokio::fs::read(&full).await {
            Ok(contents) => {
                for chunk in contents.chunks(DOWNLOAD_CHUNK) {
                    let frame = ViewerFrame::Binary(encode_download(&path, chunk));
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                let _ = tx
                    .send(ViewerFrame::Binary(encode_download(&path, &[])))
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(ViewerFrame::Message(ServerMessage::Error {
                        code: "download_failed".into(),
                        message: e.to_string(),
                    }))
                    .await;
            }
        }
    });
}

fn send_viewer_error(handle: &SessionHandle, viewer_id: u64, code: &str, message: &str) {
    if let Some(tx) = handle.viewer_tx(viewer_id) {
        let _ = tx.try_send(ViewerFrame::Message(ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    use gangway_protocol::ViewerRole;

    use crate::registry::SessionRegistry;
    use crate::session::{SessionHandle, ViewerFrame, VIEWER_BUFFER};
    use crate::supervisor::SpawnSpec;

    fn test_ctx() -> ActorContext {
        ActorContext {
            gateway: Arc::new(ProxyGateway::new(3000, Arc::new(SessionRegistry::new()))),
            terminate_grace: Duration::from_millis(500),
        }
    }

    fn test_handle(assistant: &str, command: &[&str]) -> SessionHandle {
        let (program, args) = command.split_first().expect("non-empty command");
        SessionHandle::new(
            gangway_protocol::new_id(),
            assistant.to_string(),
            SpawnSpec {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: Vec::new(),
                workdir: "/tmp".to_string(),
                cols: 80,
                rows: 24,
            },
            None,
        )
    }

    async fn attach(
        actor: &SessionActorHandle,
    ) -> (u64, mpsc::Receiver<ViewerFrame>) {
        let (tx, rx) = mpsc::channel(VIEWER_BUFFER);
        let (reply_tx, reply_rx) = oneshot::channel();
        actor
            .send(SessionCommand::Attach {
                name: None,
                role: ViewerRole::Terminal,
                tx,
                reply: reply_tx,
            })
            .await;
        let reply = reply_rx.await.expect("attach reply");
        (reply.viewer_id, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ViewerFrame>) -> ViewerFrame {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("viewer channel closed")
    }

    /// Drain frames until the exit message, returning concatenated output.
    async fn collect_output_until_exit(rx: &mut mpsc::Receiver<ViewerFrame>) -> Vec<u8> {
        let mut output = Vec::new();
        loop {
            match next_frame(rx).await {
                ViewerFrame::Binary(bytes) => output.extend_from_slice(&bytes),
                ViewerFrame::Message(ServerMessage::SessionExit { .. }) => return output,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn attach_detach_tracks_viewer_set() {
        let actor = SessionActorHandle::spawn(test_handle("shell", &["cat"]), test_ctx());
        let (id_a, _rx_a) = attach(&actor).await;
        let (_id_b, _rx_b) = attach(&actor).await;

        tokio::task::yield_now().await;
        assert_eq!(actor.snapshot().viewer_count, 2);

        actor.send(SessionCommand::Detach { viewer_id: id_a }).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(actor.snapshot().viewer_count, 1);

        // Detaching an already-removed viewer is harmless.
        actor.send(SessionCommand::Detach { viewer_id: id_a }).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(actor.snapshot().viewer_count, 1);
    }

    #[tokio::test]
    async fn interleaved_attach_detach_converges_to_empty() {
        let actor = SessionActorHandle::spawn(test_handle("shell", &["cat"]), test_ctx());
        let mut rxs = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..8 {
            let (id, rx) = attach(&actor).await;
            ids.push(id);
            rxs.push(rx);
        }
        for id in ids {
            actor.send(SessionCommand::Detach { viewer_id: id }).await;
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(actor.snapshot().viewer_count, 0);
    }

    #[tokio::test]
    async fn two_viewers_see_identical_output() {
        let actor = SessionActorHandle::spawn(
            test_handle("shell", &["sh", "-c", "printf 'hello from the pty'"]),
            test_ctx(),
        );
        let (_id_a, mut rx_a) = attach(&actor).await;
        let (_id_b, mut rx_b) = attach(&actor).await;

        actor.send(SessionCommand::StartProcess).await;

        let out_a = collect_output_until_exit(&mut rx_a).await;
        let out_b = collect_output_until_exit(&mut rx_b).await;
        assert_eq!(out_a, out_b);
        assert!(String::from_utf8_lossy(&out_a).contains("hello from the pty"));
    }

    #[tokio::test]
    async fn first_permission_resolution_wins() {
        let actor = SessionActorHandle::spawn(test_handle("claude", &["cat"]), test_ctx());
        let (_id_a, mut rx_a) = attach(&actor).await;
        let (_id_b, mut rx_b) = attach(&actor).await;

        let (ask_tx, ask_rx) = oneshot::channel();
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Bash".into(),
                reason: "wants to run a command".into(),
                tool_input: None,
                reply: ask_tx,
            })
            .await;

        // Both viewers receive the same request notification.
        let req_a = wait_for_request(&mut rx_a).await;
        let req_b = wait_for_request(&mut rx_b).await;
        assert_eq!(req_a.id, req_b.id);

        // First resolution allows; second names the same (now stale) request.
        actor
            .send(SessionCommand::PermissionResponse {
                request_id: req_a.id.clone(),
                allowed_tools: vec!["Bash".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;
        actor
            .send(SessionCommand::PermissionResponse {
                request_id: req_a.id.clone(),
                allowed_tools: vec![],
                skip_permissions: false,
                remember: false,
            })
            .await;

        let reply = timeout(Duration::from_secs(5), ask_rx)
            .await
            .expect("timed out")
            .expect("reply dropped");
        assert!(reply.allowed_tools.contains(&"Bash".to_string()));
        assert!(!reply.skip_permissions);

        // Exactly one resolution notification per viewer.
        assert_eq!(count_resolved(&mut rx_a).await, 1);
        assert_eq!(count_resolved(&mut rx_b).await, 1);
    }

    #[tokio::test]
    async fn second_request_queues_behind_first() {
        let actor = SessionActorHandle::spawn(test_handle("claude", &["cat"]), test_ctx());
        let (_id, mut rx) = attach(&actor).await;

        let (ask1_tx, _ask1_rx) = oneshot::channel();
        let (ask2_tx, ask2_rx) = oneshot::channel();
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Bash".into(),
                reason: "first".into(),
                tool_input: None,
                reply: ask1_tx,
            })
            .await;
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Write".into(),
                reason: "second".into(),
                tool_input: None,
                reply: ask2_tx,
            })
            .await;

        let first = wait_for_request(&mut rx).await;
        assert_eq!(first.tool, "Bash");

        // Resolving the first promotes the queued request.
        actor
            .send(SessionCommand::PermissionResponse {
                request_id: first.id,
                allowed_tools: vec!["Bash".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;
        let second = wait_for_request(&mut rx).await;
        assert_eq!(second.tool, "Write");

        actor
            .send(SessionCommand::PermissionResponse {
                request_id: second.id,
                allowed_tools: vec!["Write".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;
        let reply = timeout(Duration::from_secs(5), ask2_rx)
            .await
            .expect("timed out")
            .expect("reply dropped");
        assert!(reply.allowed_tools.contains(&"Write".to_string()));
    }

    #[tokio::test]
    async fn stale_response_leaves_gate_awaiting() {
        let actor = SessionActorHandle::spawn(test_handle("claude", &["cat"]), test_ctx());
        let (_id, mut rx) = attach(&actor).await;

        let (ask_tx, ask_rx) = oneshot::channel();
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Bash".into(),
                reason: "needs approval".into(),
                tool_input: None,
                reply: ask_tx,
            })
            .await;
        let request = wait_for_request(&mut rx).await;

        actor
            .send(SessionCommand::PermissionResponse {
                request_id: "not-the-current-request".into(),
                allowed_tools: vec!["Bash".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;

        // The real request still resolves afterwards.
        actor
            .send(SessionCommand::PermissionResponse {
                request_id: request.id,
                allowed_tools: vec!["Bash".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;
        let reply = timeout(Duration::from_secs(5), ask_rx)
            .await
            .expect("timed out")
            .expect("reply dropped");
        assert!(reply.allowed_tools.contains(&"Bash".to_string()));
    }

    #[tokio::test]
    async fn yolo_answers_permission_asks_immediately() {
        let actor = SessionActorHandle::spawn(test_handle("claude", &["cat"]), test_ctx());
        let (_id, _rx) = attach(&actor).await;

        actor.send(SessionCommand::SetYolo { enabled: true }).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(actor.snapshot().yolo);

        let (ask_tx, ask_rx) = oneshot::channel();
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Bash".into(),
                reason: "should skip the gate".into(),
                tool_input: None,
                reply: ask_tx,
            })
            .await;
        let reply = timeout(Duration::from_secs(5), ask_rx)
            .await
            .expect("timed out")
            .expect("reply dropped");
        assert!(reply.skip_permissions);
    }

    #[tokio::test]
    async fn yolo_is_ignored_for_plain_shells() {
        let actor = SessionActorHandle::spawn(test_handle("shell", &["cat"]), test_ctx());
        let (_id, _rx) = attach(&actor).await;

        actor.send(SessionCommand::SetYolo { enabled: true }).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let snap = actor.snapshot();
        assert!(!snap.yolo);
        assert!(!snap.yolo_supported);
    }

    #[tokio::test]
    async fn gate_pauses_output_and_input_until_resolution() {
        let actor = SessionActorHandle::spawn(test_handle("claude", &["cat"]), test_ctx());
        let (_id, mut rx) = attach(&actor).await;
        actor.send(SessionCommand::StartProcess).await;

        // Open the gate.
        let (ask_tx, _ask_rx) = oneshot::channel();
        actor
            .send(SessionCommand::PermissionAsk {
                tool: "Bash".into(),
                reason: "hold everything".into(),
                tool_input: None,
                reply: ask_tx,
            })
            .await;
        let request = wait_for_request(&mut rx).await;

        // Input while awaiting is buffered, not forwarded: no echo shows up.
        actor
            .send(SessionCommand::Input {
                bytes: Bytes::from_static(b"held-back\n"),
            })
            .await;
        let premature = timeout(Duration::from_millis(400), async {
            loop {
                if let ViewerFrame::Binary(b) = next_frame(&mut rx).await {
                    if String::from_utf8_lossy(&b).contains("held-back") {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(premature.is_err(), "input must not reach the PTY while gated");

        // Resolution flushes the buffered input through to cat.
        actor
            .send(SessionCommand::PermissionResponse {
                request_id: request.id,
                allowed_tools: vec!["Bash".into()],
                skip_permissions: false,
                remember: false,
            })
            .await;
        let mut seen = Vec::new();
        loop {
            if let ViewerFrame::Binary(b) = next_frame(&mut rx).await {
                seen.extend_from_slice(&b);
                if String::from_utf8_lossy(&seen).contains("held-back") {
                    break;
                }
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        actor.send(SessionCommand::Shutdown { reply: done_tx }).await;
        let _ = done_rx.await;
    }

    async fn wait_for_request(
        rx: &mut mpsc::Receiver<ViewerFrame>,
    ) -> gangway_protocol::PermissionRequest {
        loop {
            if let ViewerFrame::Message(ServerMessage::PermissionRequested { request }) =
                next_frame(rx).await
            {
                return request;
            }
        }
    }

    /// Count resolution frames received within a short settle window.
    async fn count_resolved(rx: &mut mpsc::Receiver<ViewerFrame>) -> usize {
        let mut count = 0;
        loop {
            match timeout(Duration::from_millis(300), rx.recv()).await {
                Ok(Some(ViewerFrame::Message(ServerMessage::PermissionResolved { .. }))) => {
                    count += 1;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return count,
            }
        }
    }
}
