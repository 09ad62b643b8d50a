/**
 * MCP Inspector Proxy Library
 *
 * A local proxy that lets a web-based MCP inspector talk to MCP servers it
 * cannot reach directly:
 * 1. The web app connects over SSE or Streamable HTTP
 * 2. Each session is backed by a stdio child process, an SSE server or a
 *    Streamable HTTP server
 * 3. Messages are relayed verbatim in both directions until either side closes
 */
pub mod config;
pub mod error;
pub mod factory;
pub mod relay;
pub mod server;
pub mod service;
pub mod transport;
pub mod utils;

// Export main types
pub use self::config::{ProxyConfig, ServerConfig, TransportKind};
pub use self::error::ProxyError;
pub use self::factory::{TransportBuilder, TransportFactory};
pub use self::server::{run_server, ProxyAuth, ProxyServerSettings, ServerDefaults};
pub use self::service::{ConnectionState, ConnectionStatus, ProxyEvent, ProxyService};
pub use self::transport::{JsonRpcMessage, Transport, TransportError};
