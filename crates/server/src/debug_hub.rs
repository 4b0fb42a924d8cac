//! Debug hub — per-session pub/sub router between iframe-side
//! instrumentation and UI observers.
//!
//! One hub per session, shared by both proxy addressing schemes. Runs as
//! its own actor with the same single-owner discipline as sessions: both
//! subscriber pools are touched only by the hub task.
//!
//! Fan-out rules: an iframe message goes to the upstream agent channel and
//! every UI observer; a UI command goes to every iframe client; an
//! externally triggered open-URL event goes to the single designated
//! observer (the most recently attached one) so multiple observers don't
//! all raise the same prompt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use gangway_protocol::debug::{parse, DebugMessage, DebugParseError};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound buffer per debug subscriber before it is dropped.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugRole {
    UiObserver,
    Iframe,
    /// The hosted agent's own channel; at most one, latest wins.
    Agent,
}

pub enum HubCommand {
    Subscribe {
        role: DebugRole,
        tx: mpsc::Sender<String>,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        client_id: u64,
    },
    /// A message published by a connected client; routed by its role.
    Publish {
        client_id: u64,
        text: String,
    },
    /// Externally triggered open-URL request.
    OpenUrl {
        url: String,
    },
}

/// Handle to a running debug hub (cheap to Clone).
#[derive(Clone)]
pub struct DebugHubHandle {
    pub session_id: String,
    command_tx: mpsc::Sender<HubCommand>,
}

impl DebugHubHandle {
    /// Spawn a hub actor for one session.
    pub fn spawn(session_id: String) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let state = HubState {
            session_id: session_id.clone(),
            ui: Vec::new(),
            iframes: Vec::new(),
            agent: None,
            active_observer: None,
            roles: HashMap::new(),
        };
        tokio::spawn(hub_loop(state, command_rx));
        Self {
            session_id,
            command_tx,
        }
    }

    pub async fn send(&self, cmd: HubCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "debug_hub",
                session_id = %self.session_id,
                "Hub channel closed, command dropped"
            );
        }
    }

    /// Subscribe a client; returns its id for later unsubscribe/publish.
    pub async fn subscribe(&self, role: DebugRole, tx: mpsc::Sender<String>) -> Option<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Subscribe {
            role,
            tx,
            reply: reply_tx,
        })
        .await;
        reply_rx.await.ok()
    }

    /// Channel capacity for a new subscriber's outbound queue.
    pub fn subscriber_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(SUBSCRIBER_BUFFER)
    }
}

struct HubState {
    session_id: String,
    ui: Vec<(u64, mpsc::Sender<String>)>,
    iframes: Vec<(u64, mpsc::Sender<String>)>,
    agent: Option<(u64, mpsc::Sender<String>)>,
    /// Designated target for externally triggered open-URL events.
    active_observer: Option<u64>,
    roles: HashMap<u64, DebugRole>,
}

async fn hub_loop(mut state: HubState, mut command_rx: mpsc::Receiver<HubCommand>) {
    while let Some(cmd) = command_rx.recv().await {
        handle_hub_command(cmd, &mut state);
    }
}

fn handle_hub_command(cmd: HubCommand, state: &mut HubState) {
    match cmd {
        HubCommand::Subscribe { role, tx, reply } => {
            let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
            state.roles.insert(id, role);
            match role {
                DebugRole::UiObserver => {
                    state.ui.push((id, tx));
                    state.active_observer = Some(id);
                }
                DebugRole::Iframe => state.iframes.push((id, tx)),
                DebugRole::Agent => {
                    if state.agent.is_some() {
                        debug!(
                            component = "debug_hub",
                            session_id = %state.session_id,
                            "Replacing existing agent channel"
                        );
                    }
                    state.agent = Some((id, tx));
                }
            }
            let _ = reply.send(id);
        }

        HubCommand::Unsubscribe { client_id } => {
            state.roles.remove(&client_id);
            state.ui.retain(|(id, _)| *id != client_id);
            state.iframes.retain(|(id, _)| *id != client_id);
            if state.agent.as_ref().is_some_and(|(id, _)| *id == client_id) {
                state.agent = None;
            }
            if state.active_observer == Some(client_id) {
                state.active_observer = state.ui.last().map(|(id, _)| *id);
            }
        }

        HubCommand::Publish { client_id, text } => {
            let Some(role) = state.roles.get(&client_id).copied() else {
                debug!(
                    component = "debug_hub",
                    session_id = %state.session_id,
                    client_id,
                    "Publish from unknown client, dropping"
                );
                return;
            };
            let msg = match parse(&text) {
                Ok(msg) => msg,
                Err(DebugParseError::UnknownType(name)) => {
                    warn!(
                        component = "debug_hub",
                        session_id = %state.session_id,
                        message_type = %name,
                        "Unsupported debug message type, dropping"
                    );
                    return;
                }
                Err(DebugParseError::Malformed(err)) => {
                    warn!(
                        component = "debug_hub",
                        session_id = %state.session_id,
                        error = %err,
                        "Malformed debug message, dropping"
                    );
                    return;
                }
            };
            route(state, role, &msg, &text);
        }

        HubCommand::OpenUrl { url } => {
            let text = serde_json::to_string(&DebugMessage::OpenUrl { url })
                .expect("open_url serializes");
            send_to_active_observer(state, &text);
        }
    }
}

fn route(state: &mut HubState, from: DebugRole, msg: &DebugMessage, text: &str) {
    match from {
        // Iframe telemetry: upstream agent channel + every UI observer.
        DebugRole::Iframe => {
            let agent_gone = match &state.agent {
                Some((id, tx)) => {
                    let failed = tx.try_send(text.to_string()).is_err();
                    if failed {
                        debug!(
                            component = "debug_hub",
                            session_id = %state.session_id,
                            client_id = *id,
                            "Agent channel unavailable, dropping it"
                        );
                    }
                    failed
                }
                None => false,
            };
            if agent_gone {
                state.agent = None;
            }
            fan_out(&mut state.ui, text, &mut state.active_observer);
        }

        // UI commands go to every iframe client.
        DebugRole::UiObserver => {
            fan_out(&mut state.iframes, text, &mut None);
        }

        // Agent-originated open-URL: designated observer only. Anything
        // else from the agent is relayed to observers like telemetry.
        DebugRole::Agent => {
            if matches!(msg, DebugMessage::OpenUrl { .. }) {
                send_to_active_observer(state, text);
            } else {
                fan_out(&mut state.ui, text, &mut state.active_observer);
            }
        }
    }
}

fn send_to_active_observer(state: &mut HubState, text: &str) {
    let Some(target) = state.active_observer else {
        debug!(
            component = "debug_hub",
            session_id = %state.session_id,
            "No observer attached for open-URL event"
        );
        return;
    };
    let failed = match state.ui.iter().find(|(id, _)| *id == target) {
        Some((_, tx)) => tx.try_send(text.to_string()).is_err(),
        None => false,
    };
    if failed {
        state.ui.retain(|(id, _)| *id != target);
        state.active_observer = state.ui.last().map(|(id, _)| *id);
    }
}

fn fan_out(
    pool: &mut Vec<(u64, mpsc::Sender<String>)>,
    text: &str,
    active: &mut Option<u64>,
) {
    let mut dropped = Vec::new();
    pool.retain(|(id, tx)| match tx.try_send(text.to_string()) {
        Ok(()) => true,
        Err(_) => {
            dropped.push(*id);
            false
        }
    });
    if let Some(current) = *active {
        if dropped.contains(&current) {
            *active = pool.last().map(|(id, _)| *id);
        }
    }
}
