use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Constants
pub const DEFAULT_PROXY_PORT: u16 = 6277;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
pub const PROXY_AUTH_HEADER: &str = "x-mcp-proxy-auth";

/// Opaque identifier shared by both halves of a proxied session.
pub type SessionId = String;

pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
