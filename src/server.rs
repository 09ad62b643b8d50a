use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::{parse_env_json, ConfigError, ServerConfig, TransportKind};
use crate::error::ProxyError;
use crate::service::{ConnectionStatus, ProxyService, SseSession};
use crate::transport::sse_server::SseServerTransport;
use crate::transport::streamable_http_server::{PostOutcome, StreamableHttpServerTransport};
use crate::transport::{JsonRpcMessage, Transport, TransportError};
use crate::utils::{
    new_session_id, DEFAULT_PROXY_PORT, DEFAULT_SSE_KEEP_ALIVE, MCP_SESSION_ID_HEADER,
    PROXY_AUTH_HEADER,
};

/// Backing server used when a connect request leaves parameters out.
#[derive(Debug, Clone)]
pub struct ServerDefaults {
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub server_url: Option<String>,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: None,
            args: Vec::new(),
            server_url: None,
        }
    }
}

/// How the web app proves it may use the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAuth {
    /// Every route but `/health` needs `X-MCP-Proxy-Auth: Bearer <token>`.
    Token(String),
    /// Any caller that can reach the port may spawn servers.
    Disabled,
}

impl ProxyAuth {
    /// A fresh random token.
    pub fn generate() -> Self {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::Token(token)
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Token(token) => Some(token.as_str()),
            Self::Disabled => None,
        }
    }
}

impl Default for ProxyAuth {
    fn default() -> Self {
        Self::generate()
    }
}

/// Settings for the proxy's HTTP surface
#[derive(Debug, Clone)]
pub struct ProxyServerSettings {
    pub bind_addr: SocketAddr,
    pub auth: ProxyAuth,
    pub keep_alive: Duration,
    pub defaults: ServerDefaults,
}

impl Default for ProxyServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            auth: ProxyAuth::default(),
            keep_alive: DEFAULT_SSE_KEEP_ALIVE,
            defaults: ServerDefaults::default(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: ProxyService,
    settings: Arc<ProxyServerSettings>,
}

/// Query parameters naming the backing server of a new session.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub transport_type: Option<TransportKind>,
    pub command: Option<String>,
    /// Shell-style argument string.
    pub args: Option<String>,
    /// JSON object of environment variables.
    pub env: Option<String>,
    pub url: Option<String>,
    pub server_id: Option<String>,
    pub name: Option<String>,
}

impl ConnectParams {
    /// Resolve against the defaults into a server config. Validation is left to the factory.
    pub fn to_server_config(
        &self,
        defaults: &ServerDefaults,
    ) -> Result<ServerConfig, ConfigError> {
        let id = self.server_id.clone().unwrap_or_else(new_session_id);
        let name = self.name.clone().unwrap_or_else(|| id.clone());
        let kind = self.transport_type.unwrap_or(defaults.transport);

        let mut config = match kind {
            TransportKind::Stdio => {
                let (command, args) = match &self.command {
                    Some(command) => {
                        let raw = self.args.as_deref().unwrap_or_default();
                        let args = shlex::split(raw).ok_or_else(|| ConfigError::InvalidCommand {
                            command: raw.to_string(),
                        })?;
                        (Some(command.clone()), args)
                    }
                    None => (defaults.command.clone(), defaults.args.clone()),
                };
                let mut config = ServerConfig::new(id, name, kind);
                config.command = command;
                config.args = args;
                config
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                let mut config = ServerConfig::new(id, name, kind);
                config.url = self.url.clone().or_else(|| defaults.server_url.clone());
                config
            }
        };
        config.env = parse_env_json("env query parameter", self.env.as_deref())?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Error body returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn session_not_found(session_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("Session {} not found", session_id),
        )
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        let status = match &e {
            ProxyError::Config(_) => StatusCode::BAD_REQUEST,
            ProxyError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NoTransport(_) | ProxyError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Transport { .. } | ProxyError::Send { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        ProxyError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed ({}): {}", self.status, self.message);
        } else {
            debug!("Request rejected ({}): {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Map a web transport rejection to a response for `session_id`.
fn web_transport_error(session_id: &str, e: TransportError) -> ApiError {
    match e {
        TransportError::Closed => ApiError::session_not_found(session_id),
        TransportError::Protocol(reason) => ApiError::new(StatusCode::CONFLICT, reason),
        other => ApiError::new(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

type EventStream = Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>;

fn message_event(message: JsonRpcMessage) -> Result<Event, Infallible> {
    Ok(Event::default().event("message").data(message.to_string()))
}

fn event_stream(messages: BoxStream<'static, JsonRpcMessage>, keep_alive: Duration) -> EventStream {
    Sse::new(messages.map(message_event).boxed()).keep_alive(KeepAlive::new().interval(keep_alive))
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Build the proxy's router.
pub fn router(service: ProxyService, settings: ProxyServerSettings) -> Router {
    let state = AppState {
        service,
        settings: Arc::new(settings),
    };

    let mut protected = Router::new()
        .route("/config", get(config_handler))
        .route("/connections", get(connections_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_get_handler)
                .delete(mcp_delete_handler),
        );
    if state.settings.auth.token().is_some() {
        protected = protected.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(MCP_SESSION_ID_HEADER)]);

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(token) = state.settings.auth.token() else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(PROXY_AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if provided == Some(token) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected request without a valid proxy token");
        ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn config_handler(State(state): State<AppState>) -> Json<Value> {
    let defaults = &state.settings.defaults;
    let args = shlex::try_join(defaults.args.iter().map(String::as_str))
        .unwrap_or_else(|_| defaults.args.join(" "));
    Json(json!({
        "defaultEnvironment": state.service.config().default_env,
        "defaultCommand": defaults.command.clone().unwrap_or_default(),
        "defaultArgs": args,
        "defaultTransport": defaults.transport,
        "defaultServerUrl": defaults.server_url.clone().unwrap_or_default(),
    }))
}

async fn connections_handler(State(state): State<AppState>) -> Json<Vec<ConnectionStatus>> {
    Json(state.service.get_all_connection_statuses())
}

async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<EventStream, ApiError> {
    let config = params.to_server_config(&state.settings.defaults)?;
    let SseSession {
        session_id,
        transport,
        outbound,
    } = state
        .service
        .create_sse_session(&config, Some(&headers))
        .await?;
    info!(session_id = %session_id, "SSE connection from web app");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={}", session_id));
    let messages = ReceiverStream::new(outbound).map(message_event);
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(endpoint) })
        .chain(messages)
        .take_until(transport.cancellation_token().cancelled_owned())
        .boxed();

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.settings.keep_alive)))
}

async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let session_id = query.session_id;
    let web = state
        .service
        .get_web_app_transport(&session_id)
        .ok_or_else(|| ApiError::session_not_found(&session_id))?;
    let sse = web
        .as_any()
        .downcast_ref::<SseServerTransport>()
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("Session {} is not an SSE session", session_id),
            )
        })?;
    sse.receive(message)
        .map_err(|e| web_transport_error(&session_id, e))?;
    Ok(StatusCode::ACCEPTED)
}

fn streamable<'a>(
    session_id: &str,
    web: &'a Arc<dyn Transport>,
) -> Result<&'a StreamableHttpServerTransport, ApiError> {
    web.as_any()
        .downcast_ref::<StreamableHttpServerTransport>()
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("Session {} is not a Streamable HTTP session", session_id),
            )
        })
}

fn existing_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(String, Arc<dyn Transport>), ApiError> {
    let session_id = session_header(headers).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Missing {} header", MCP_SESSION_ID_HEADER),
        )
    })?;
    let web = state
        .service
        .get_web_app_transport(&session_id)
        .ok_or_else(|| ApiError::session_not_found(&session_id))?;
    Ok((session_id, web))
}

async fn mcp_post_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let messages = match body {
        Value::Array(batch) => batch,
        message => vec![message],
    };

    let (session_id, web): (String, Arc<dyn Transport>) = if session_header(&headers).is_some() {
        existing_session(&state, &headers)?
    } else {
        let config = params.to_server_config(&state.settings.defaults)?;
        let session = state
            .service
            .create_streamable_http_session(&config, Some(&headers))
            .await?;
        info!(session_id = %session.session_id, "Streamable HTTP connection from web app");
        let transport: Arc<dyn Transport> = session.transport;
        (session.session_id, transport)
    };

    let outcome = streamable(&session_id, &web)?
        .handle_post(messages)
        .map_err(|e| web_transport_error(&session_id, e))?;
    let id_header = [(MCP_SESSION_ID_HEADER, session_id)];
    Ok(match outcome {
        PostOutcome::Accepted => (StatusCode::ACCEPTED, id_header).into_response(),
        PostOutcome::Stream(messages) => {
            (id_header, event_stream(messages, state.settings.keep_alive)).into_response()
        }
    })
}

async fn mcp_get_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (session_id, web) = existing_session(&state, &headers)?;
    let messages = streamable(&session_id, &web)?
        .open_standalone_stream()
        .map_err(|e| web_transport_error(&session_id, e))?;
    Ok((
        [(MCP_SESSION_ID_HEADER, session_id)],
        event_stream(messages, state.settings.keep_alive),
    )
        .into_response())
}

async fn mcp_delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (session_id, _) = existing_session(&state, &headers)?;
    state.service.close_connection(&session_id).await;
    info!(session_id = %session_id, "Session deleted by web app");
    Ok(StatusCode::OK)
}

/// Serve the proxy on `listener` until `shutdown` is cancelled, then close every session.
pub async fn serve(
    listener: tokio::net::TcpListener,
    service: ProxyService,
    settings: ProxyServerSettings,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(service.clone(), settings);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Starting graceful shutdown...");
            // Ends every open event stream so the server can drain
            service.close_all_connections().await;
        })
        .await
}

/// Bind the configured address and serve until Ctrl+C or SIGTERM.
pub async fn run_server(
    service: ProxyService,
    settings: ProxyServerSettings,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("MCP inspector proxy listening on http://{}", actual_addr);
    match settings.auth.token() {
        Some(token) => info!("Proxy session token: {}", token),
        None => warn!("Proxy authentication is disabled, any local page can spawn processes"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    serve(listener, service, settings, shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating shutdown...");
        },
    }

    shutdown_token.cancel();
}
