//! Proxy gateway — reaches a session's auxiliary HTTP services through two
//! addressing schemes that resolve to the same backend and the same debug
//! hub.
//!
//! Port-based: a dedicated listener per derived proxy port, cross-origin
//! relative to the main UI, so every response carries permissive CORS
//! headers. Path-based: `/proxy/{session}/{service}/…` on the main
//! listener, same-origin, with HTML/URL rewriting for the path prefix.
//! Every response from either front end carries the `X-Proxy-Active`
//! marker — failure responses included — so a probing client can tell
//! "gateway up, backend not ready" from "no gateway at all".

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use gangway_protocol::probe::PROXY_ACTIVE_HEADER;
use gangway_protocol::ProxyPorts;

use crate::debug_hub::DebugRole;
use crate::registry::SessionRegistry;
use crate::websocket::serve_debug_socket;

/// Largest request/response body the gateway will buffer for forwarding.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Instrumentation injected into proxied HTML. Connects back to the debug
/// hub through whichever front end served the page and publishes console,
/// error, and network telemetry; navigate/reload commands come back down
/// the same socket.
const DEBUG_CLIENT_JS: &str = r#"(function () {
  if (window.__gangwayDebug) return;
  window.__gangwayDebug = true;
  var proto = location.protocol === 'https:' ? 'wss://' : 'ws://';
  var base = document.querySelector('base');
  var root = base ? new URL(base.href).pathname : '/';
  var ws = new WebSocket(proto + location.host + root + '__gangway/debug');
  function send(msg) {
    if (ws.readyState === WebSocket.OPEN) ws.send(JSON.stringify(msg));
  }
  ws.addEventListener('open', function () {
    send({ type: 'page_load', url: location.href });
  });
  ws.addEventListener('message', function (ev) {
    var msg = JSON.parse(ev.data);
    if (msg.type === 'navigate') location.assign(msg.url);
    if (msg.type === 'reload') location.reload();
    if (msg.type === 'query_dom') {
      var el = document.querySelector(msg.selector);
      send({ type: 'dom_result', request_id: msg.request_id, html: el ? el.outerHTML : '' });
    }
  });
  ['log', 'info', 'warn', 'error'].forEach(function (level) {
    var orig = console[level];
    console[level] = function () {
      send({ type: 'console', level: level, message: Array.prototype.join.call(arguments, ' ') });
      orig.apply(console, arguments);
    };
  });
  window.addEventListener('error', function (ev) {
    send({ type: 'page_error', message: String(ev.message), stack: ev.error && ev.error.stack });
  });
  window.addEventListener('unhandledrejection', function (ev) {
    send({ type: 'unhandled_rejection', message: String(ev.reason) });
  });
  var origFetch = window.fetch;
  window.fetch = function (input, init) {
    var started = Date.now();
    var method = (init && init.method) || 'GET';
    var url = typeof input === 'string' ? input : input.url;
    return origFetch.apply(window, arguments).then(function (res) {
      send({ type: 'fetch', method: method, url: url, status: res.status, duration_ms: Date.now() - started });
      return res;
    }, function (err) {
      send({ type: 'fetch', method: method, url: url });
      throw err;
    });
  };
})();
"#;

/// Which auxiliary service a proxy path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyService {
    App,
    AgentChat,
}

impl ProxyService {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "app" => Some(Self::App),
            "chat" => Some(Self::AgentChat),
            _ => None,
        }
    }

    fn target(self, ports: ProxyPorts) -> u16 {
        match self {
            Self::App => ports.app,
            Self::AgentChat => ports.agent_chat,
        }
    }
}

pub struct ProxyGateway {
    offset: u16,
    client: reqwest::Client,
    registry: Arc<SessionRegistry>,
    listeners: DashMap<u16, JoinHandle<()>>,
    session_ports: DashMap<String, Vec<u16>>,
}

impl ProxyGateway {
    pub fn new(offset: u16, registry: Arc<SessionRegistry>) -> Self {
        Self {
            offset,
            client: reqwest::Client::new(),
            registry,
            listeners: DashMap::new(),
            session_ports: DashMap::new(),
        }
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Spawn the two dedicated port-based listeners for a session's derived
    /// port chain. Idempotent per port.
    pub async fn ensure_session_listeners(self: Arc<Self>, session_id: &str, ports: ProxyPorts) {
        let mut bound = Vec::new();
        for (listen_port, target_port) in [
            (ports.app_proxy, ports.app),
            (ports.chat_proxy, ports.agent_chat),
        ] {
            if self.listeners.contains_key(&listen_port) {
                bound.push(listen_port);
                continue;
            }
            let listener =
                match tokio::net::TcpListener::bind(("0.0.0.0", listen_port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(
                            component = "proxy",
                            event = "proxy.bind_failed",
                            session_id = %session_id,
                            port = listen_port,
                            error = %e,
                            "Failed to bind port-based proxy listener"
                        );
                        continue;
                    }
                };
            info!(
                component = "proxy",
                event = "proxy.listener_started",
                session_id = %session_id,
                port = listen_port,
                target = target_port,
                "Port-based proxy listener up"
            );
            let state = PortProxyState {
                gateway: self.clone(),
                session_id: session_id.to_string(),
                target_port,
            };
            // Cross-origin relative to the main UI: echo the origin (an
            // allow-all wildcard cannot carry credentials) and expose the
            // probe marker. The marker middleware sits outside the CORS
            // layer so preflight responses carry it too.
            let cors = CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::HEAD,
                    Method::OPTIONS,
                ])
                .allow_headers(AllowHeaders::mirror_request())
                .expose_headers([HeaderName::from_static(PROXY_ACTIVE_HEADER)]);
            let app = Router::new()
                .route("/__gangway/debug", any(port_debug_handler))
                .route("/__gangway/debug/client.js", get(debug_client_handler))
                .fallback(port_proxy_handler)
                .layer(cors)
                .layer(middleware::from_fn(mark_active_middleware))
                .with_state(state);
            let handle = tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(
                        component = "proxy",
                        event = "proxy.listener_failed",
                        error = %e,
                        "Port-based proxy listener exited"
                    );
                }
            });
            self.listeners.insert(listen_port, handle);
            bound.push(listen_port);
        }
        self.session_ports.insert(session_id.to_string(), bound);
    }

    /// Tear down a session's dedicated listeners.
    pub fn drop_session_listeners(&self, session_id: &str) {
        let Some((_, ports)) = self.session_ports.remove(session_id) else {
            return;
        };
        for port in ports {
            if let Some((_, handle)) = self.listeners.remove(&port) {
                handle.abort();
                debug!(
                    component = "proxy",
                    event = "proxy.listener_stopped",
                    session_id = %session_id,
                    port,
                    "Port-based proxy listener stopped"
                );
            }
        }
    }

    /// Resolve a session's derived port chain from its announced base port.
    fn ports_for(&self, session_id: &str) -> Option<ProxyPorts> {
        let entry = self.registry.get(session_id)?;
        let base = entry.actor.snapshot().base_port?;
        ProxyPorts::derive(base, self.offset).ok()
    }

    /// Forward a request to `127.0.0.1:target_port`, returning the backend
    /// response or a marked 502 when the backend is not yet listening.
    async fn forward(
        &self,
        target_port: u16,
        path_and_query: &str,
        req: Request,
        rewrite: Option<&RewriteContext>,
    ) -> Response {
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(b) => b,
            Err(_) => {
                return marked_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
            }
        };

        let url = format!("http://127.0.0.1:{target_port}{path_and_query}");
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(resp) => resp,
            Err(e) => {
                debug!(
                    component = "proxy",
                    event = "proxy.backend_unready",
                    target = target_port,
                    error = %crate::error::SessionError::BackendUnready(target_port),
                    cause = %e,
                    "Backend not reachable"
                );
                return marked_error(StatusCode::BAD_GATEWAY, "backend is not ready");
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let bytes = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                debug!(
                    component = "proxy",
                    event = "proxy.body_read_failed",
                    target = target_port,
                    error = %e,
                    "Failed reading backend body"
                );
                return marked_error(StatusCode::BAD_GATEWAY, "backend body read failed");
            }
        };

        let body = if let Some(ctx) = rewrite {
            if let Some(location) = headers.get(header::LOCATION).cloned() {
                if let Ok(loc) = location.to_str() {
                    let rewritten = rewrite_location(loc, &ctx.prefix);
                    if let Ok(value) = HeaderValue::from_str(&rewritten) {
                        headers.insert(header::LOCATION, value);
                    }
                }
            }
            if content_type.starts_with("text/html") {
                let html = String::from_utf8_lossy(&bytes);
                let injected = inject_html(&html, Some(&ctx.prefix), &ctx.script_src());
                headers.remove(header::CONTENT_LENGTH);
                Body::from(injected)
            } else {
                Body::from(bytes)
            }
        } else if content_type.starts_with("text/html") {
            // Port-based pages still get the debug client; they are served
            // from the listener root so no base rewrite is needed.
            let html = String::from_utf8_lossy(&bytes);
            let injected = inject_html(&html, None, "/__gangway/debug/client.js");
            headers.remove(header::CONTENT_LENGTH);
            Body::from(injected)
        } else {
            Body::from(bytes)
        };

        let mut response = Response::builder().status(status);
        if let Some(resp_headers) = response.headers_mut() {
            *resp_headers = headers;
        }
        let mut response = response
            .body(body)
            .unwrap_or_else(|_| marked_error(StatusCode::BAD_GATEWAY, "response build failed"));
        mark_proxy_active(response.headers_mut());
        response
    }
}

/// Path-prefix context for the path-based front end.
struct RewriteContext {
    prefix: String,
}

impl RewriteContext {
    fn new(session_id: &str, service: &str) -> Self {
        Self {
            prefix: format!("/proxy/{session_id}/{service}/"),
        }
    }

    fn script_src(&self) -> String {
        format!("{}__gangway/debug/client.js", self.prefix)
    }
}

// -- Path-based front end (mounted on the main router) --

pub fn path_proxy_routes() -> Router<Arc<crate::state::App>> {
    Router::new()
        .route(
            "/proxy/{session_id}/{service}/__gangway/debug",
            any(path_debug_handler),
        )
        .route(
            "/proxy/{session_id}/{service}/__gangway/debug/client.js",
            get(debug_client_handler_unit),
        )
        .route("/proxy/{session_id}/{service}", any(path_proxy_root_handler))
        .route(
            "/proxy/{session_id}/{service}/{*rest}",
            any(path_proxy_handler),
        )
}

async fn path_proxy_root_handler(
    State(app): State<Arc<crate::state::App>>,
    Path((session_id, service)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy_path_request(&app, &session_id, &service, String::new(), req).await
}

async fn path_proxy_handler(
    State(app): State<Arc<crate::state::App>>,
    Path((session_id, service, rest)): Path<(String, String, String)>,
    req: Request,
) -> Response {
    proxy_path_request(&app, &session_id, &service, rest, req).await
}

async fn proxy_path_request(
    app: &Arc<crate::state::App>,
    session_id: &str,
    service: &str,
    rest: String,
    req: Request,
) -> Response {
    let Some(service_kind) = ProxyService::parse(service) else {
        return marked_error(StatusCode::NOT_FOUND, "unknown proxy service");
    };
    let Some(ports) = app.gateway.ports_for(session_id) else {
        return marked_error(StatusCode::BAD_GATEWAY, "session has not announced a port");
    };
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let path_and_query = format!("/{rest}{query}");
    let ctx = RewriteContext::new(session_id, service);
    app.gateway
        .forward(service_kind.target(ports), &path_and_query, req, Some(&ctx))
        .await
}

async fn path_debug_handler(
    State(app): State<Arc<crate::state::App>>,
    Path((session_id, _service)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(entry) = app.registry.get(&session_id) else {
        return marked_error(StatusCode::NOT_FOUND, "unknown session");
    };
    let hub = entry.debug.clone();
    let mut response =
        ws.on_upgrade(move |socket| serve_debug_socket(socket, hub, DebugRole::Iframe));
    mark_proxy_active(response.headers_mut());
    response
}

async fn debug_client_handler_unit() -> Response {
    debug_client_response()
}

// -- Port-based front end (dedicated listeners) --

#[derive(Clone)]
struct PortProxyState {
    gateway: Arc<ProxyGateway>,
    session_id: String,
    target_port: u16,
}

async fn port_proxy_handler(State(state): State<PortProxyState>, req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    state
        .gateway
        .forward(state.target_port, &path_and_query, req, None)
        .await
}

async fn port_debug_handler(State(state): State<PortProxyState>, ws: WebSocketUpgrade) -> Response {
    let Some(entry) = state.gateway.registry.get(&state.session_id) else {
        return marked_error(StatusCode::NOT_FOUND, "unknown session");
    };
    let hub = entry.debug.clone();
    let mut response =
        ws.on_upgrade(move |socket| serve_debug_socket(socket, hub, DebugRole::Iframe));
    mark_proxy_active(response.headers_mut());
    response
}

async fn debug_client_handler(State(_state): State<PortProxyState>) -> Response {
    debug_client_response()
}

fn debug_client_response() -> Response {
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/javascript")],
        DEBUG_CLIENT_JS,
    )
        .into_response();
    mark_proxy_active(response.headers_mut());
    response
}

// -- Header plumbing --

fn marked_error(status: StatusCode, body: &'static str) -> Response {
    let mut response = (status, body).into_response();
    mark_proxy_active(response.headers_mut());
    response
}

fn mark_proxy_active(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static(PROXY_ACTIVE_HEADER),
        HeaderValue::from_static("1"),
    );
}

/// Stamp the probe marker on every response a port-based listener emits,
/// preflight responses included.
async fn mark_active_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    mark_proxy_active(response.headers_mut());
    response
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite an absolute-path redirect target under the path prefix.
fn rewrite_location(location: &str, prefix: &str) -> String {
    if let Some(rest) = location.strip_prefix('/') {
        format!("{prefix}{rest}")
    } else {
        location.to_string()
    }
}

/// Inject a `<base href>` (path-based only) and the debug client script
/// into an HTML document, right after `<head>` when present.
fn inject_html(html: &str, base_href: Option<&str>, script_src: &str) -> String {
    let mut injection = String::new();
    if let Some(href) = base_href {
        injection.push_str(&format!("<base href=\"{href}\">"));
    }
    injection.push_str(&format!("<script src=\"{script_src}\"></script>"));

    if let Some(idx) = find_ascii_ci(html, "<head>") {
        let insert_at = idx + "<head>".len();
        let mut out = String::with_capacity(html.len() + injection.len());
        out.push_str(&html[..insert_at]);
        out.push_str(&injection);
        out.push_str(&html[insert_at..]);
        out
    } else {
        format!("{injection}{html}")
    }
}

/// Byte offset of an ASCII needle, case-insensitively. Byte-accurate even
/// when the haystack contains multi-byte UTF-8.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_rewrite_prefixes_absolute_paths() {
        let prefix = "/proxy/sess-1/app/";
        assert_eq!(
            rewrite_location("/login", prefix),
            "/proxy/sess-1/app/login"
        );
        // Relative and absolute-URL targets are left alone.
        assert_eq!(rewrite_location("login", prefix), "login");
        assert_eq!(
            rewrite_location("https://example.com/x", prefix),
            "https://example.com/x"
        );
    }

    #[test]
    fn html_injection_lands_after_head() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = inject_html(html, Some("/proxy/s/app/"), "/proxy/s/app/__gangway/debug/client.js");
        let head_idx = out.find("<head>").unwrap();
        let base_idx = out.find("<base href=\"/proxy/s/app/\">").unwrap();
        let title_idx = out.find("<title>").unwrap();
        assert!(head_idx < base_idx && base_idx < title_idx);
        assert!(out.contains("__gangway/debug/client.js"));
    }

    #[test]
    fn html_injection_without_head_prepends() {
        let out = inject_html("<p>bare</p>", None, "/__gangway/debug/client.js");
        assert!(out.starts_with("<script"));
        assert!(!out.contains("<base"));
    }

    #[test]
    fn error_responses_carry_the_marker() {
        let response = marked_error(StatusCode::BAD_GATEWAY, "backend is not ready");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(PROXY_ACTIVE_HEADER).unwrap(),
            "1"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_TYPE).is_some());
    }
}
