//! Gangway Server
//!
//! Hosts pseudo-terminal sessions (AI coding agents or shells) for browser
//! viewers over WebSocket, gates sensitive tool calls behind a human
//! decision, and proxies each session's auxiliary HTTP services through
//! port-based and path-based front ends.

mod debug_hub;
mod error;
mod git;
mod hooks;
mod logging;
mod paths;
mod permission;
mod proxy;
mod registry;
mod session;
mod session_actor;
mod session_command;
mod state;
mod supervisor;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::proxy::ProxyGateway;
use crate::registry::SessionRegistry;
use crate::state::{App, Config};

#[derive(Parser, Debug)]
#[command(name = "gangway-server", about = "Session host for browser-attached agent terminals")]
struct Args {
    /// Main listener port (websocket, path-based proxy, hook API)
    #[arg(long, default_value_t = 4000, env = "GANGWAY_PORT")]
    port: u16,

    /// Offset added to application ports for dedicated proxy listeners
    #[arg(long, default_value_t = 3000, env = "GANGWAY_PROXY_OFFSET")]
    proxy_offset: u16,

    /// Data directory (logs). Defaults to ~/.gangway
    #[arg(long, env = "GANGWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Reap viewerless sessions after this many seconds of inactivity
    #[arg(long, default_value_t = 900, env = "GANGWAY_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: u64,

    /// Keep an exited session this many seconds for reattach
    #[arg(long, default_value_t = 60, env = "GANGWAY_EXIT_GRACE_SECS")]
    exit_grace_secs: u64,

    /// Graceful-stop window before a forceful kill
    #[arg(long, default_value_t = 5, env = "GANGWAY_TERMINATE_GRACE_SECS")]
    terminate_grace_secs: u64,

    /// Assistant identity used when an attach names none
    #[arg(long, default_value = "claude", env = "GANGWAY_ASSISTANT")]
    assistant: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    paths::init_data_dir(args.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = logging::init_logging()?;
    let _log_guard = logging.guard;

    info!(
        component = "main",
        event = "server.starting",
        run_id = %logging.run_id,
        port = args.port,
        proxy_offset = args.proxy_offset,
        "Starting Gangway server"
    );

    let default_workdir = std::env::current_dir()?
        .to_string_lossy()
        .into_owned();
    let config = Config {
        port: args.port,
        proxy_offset: args.proxy_offset,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        exit_grace: Duration::from_secs(args.exit_grace_secs),
        terminate_grace: Duration::from_secs(args.terminate_grace_secs),
        default_assistant: args.assistant,
        default_workdir,
    };

    let registry = Arc::new(SessionRegistry::new());
    let gateway = Arc::new(ProxyGateway::new(config.proxy_offset, registry.clone()));
    let app_state = Arc::new(App {
        registry: registry.clone(),
        gateway,
        config: config.clone(),
    });

    tokio::spawn(registry::run_reaper(
        registry,
        config.idle_timeout,
        config.exit_grace,
    ));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", get(sessions_handler))
        .route(
            "/api/sessions/{session_id}/permission",
            post(hooks::permission_hook_handler),
        )
        .route(
            "/api/sessions/{session_id}/port",
            post(hooks::port_hook_handler),
        )
        .route(
            "/api/sessions/{session_id}/open-url",
            post(hooks::open_url_hook_handler),
        )
        .route("/ws/{session_id}", any(websocket::pty_ws_handler))
        .route(
            "/ws/{session_id}/debug/{role}",
            any(websocket::debug_ws_handler),
        )
        .merge(proxy::path_proxy_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        component = "main",
        event = "server.listening",
        addr = %addr,
        "Listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// Snapshot list of every registered session.
async fn sessions_handler(State(app): State<Arc<App>>) -> impl IntoResponse {
    let sessions: Vec<gangway_protocol::SessionStatus> = app
        .registry
        .snapshots()
        .iter()
        .map(|snapshot| snapshot.status())
        .collect();
    Json(sessions)
}
