//! Shared application state and server configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::proxy::ProxyGateway;
use crate::registry::SessionRegistry;

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Main listener port (websocket, path-based proxy, hook API).
    pub port: u16,
    /// Offset added to derived application ports for the dedicated
    /// port-based proxy listeners.
    pub proxy_offset: u16,
    /// Idle window after which a viewerless session is reaped.
    pub idle_timeout: Duration,
    /// Reconnect grace after the hosted process exits.
    pub exit_grace: Duration,
    /// Graceful-stop window before a forceful kill.
    pub terminate_grace: Duration,
    /// Assistant identity used when an attach names none.
    pub default_assistant: String,
    /// Working directory used when an attach names none.
    pub default_workdir: String,
}

/// Process-wide state handed to every handler.
pub struct App {
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<ProxyGateway>,
    pub config: Config,
}
