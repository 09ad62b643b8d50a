/**
 * Builds backing-server transports from declarative server configs.
 *
 * Every transport leaves here started, bounded by the connection timeout, and
 * with the factory's logging subscribers chained onto its hooks.
 */
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ProxyConfig, ServerConfig, TransportKind};
use crate::error::{ProxyError, Result};
use crate::transport::sse_client::SseClientTransport;
use crate::transport::stdio::{StdioServerParameters, StdioTransport};
use crate::transport::streamable_http_client::StreamableHttpClientTransport;
use crate::transport::{Transport, TransportError};
use crate::utils::{LAST_EVENT_ID_HEADER, MCP_SESSION_ID_HEADER};

/// Inbound headers copied to an SSE backing server. Nothing else is forwarded.
pub const SSE_PASSTHROUGH_HEADERS: &[&str] = &["authorization"];

/// Inbound headers copied to a Streamable HTTP backing server. Nothing else is forwarded.
pub const STREAMABLE_HTTP_PASSTHROUGH_HEADERS: &[&str] =
    &["authorization", MCP_SESSION_ID_HEADER, LAST_EVENT_ID_HEADER];

/// Anything that can turn a server config into a started backing transport.
#[async_trait]
pub trait TransportBuilder: Send + Sync + 'static {
    async fn create_transport(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<Arc<dyn Transport>>;
}

#[derive(Debug, Clone)]
pub struct TransportFactory {
    base_env: HashMap<String, String>,
    default_env: HashMap<String, String>,
    connection_timeout: Duration,
}

impl TransportFactory {
    pub fn new(default_env: HashMap<String, String>, connection_timeout: Duration) -> Self {
        Self {
            base_env: std::env::vars().collect(),
            default_env,
            connection_timeout,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.default_env.clone(), config.connection_timeout)
    }

    /// Replace the process environment snapshot stdio servers inherit.
    pub fn with_base_env(mut self, base_env: HashMap<String, String>) -> Self {
        self.base_env = base_env;
        self
    }

    pub fn default_env(&self) -> &HashMap<String, String> {
        &self.default_env
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    fn build(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match config.kind {
            TransportKind::Stdio => {
                let params = self.stdio_parameters(config)?;
                info!(
                    "Stdio transport: command={}, args={:?}",
                    params.program.display(),
                    params.args
                );
                Arc::new(StdioTransport::new(params))
            }
            TransportKind::Sse => {
                let url = config.parsed_url()?;
                let headers = build_request_headers(config, request_headers)?;
                info!("SSE transport: url={}", url);
                Arc::new(
                    SseClientTransport::new(url, headers)
                        .map_err(|source| transport_error(config, source))?,
                )
            }
            TransportKind::StreamableHttp => {
                let url = config.parsed_url()?;
                let headers = build_request_headers(config, request_headers)?;
                info!("Streamable HTTP transport: url={}", url);
                Arc::new(
                    StreamableHttpClientTransport::new(url, headers)
                        .map_err(|source| transport_error(config, source))?,
                )
            }
        };
        Ok(transport)
    }

    fn stdio_parameters(&self, config: &ServerConfig) -> Result<StdioServerParameters> {
        let command = config.command.as_deref().unwrap_or_default();
        let env = merge_env(&self.base_env, &self.default_env, &config.env);
        let (program, args) = resolve_command(command, &config.args, env.get("PATH"))?;
        Ok(StdioServerParameters { program, args, env })
    }

    /// Start the transport within the connection timeout, force-closing it on failure.
    async fn start_guarded(
        &self,
        config: &ServerConfig,
        transport: &Arc<dyn Transport>,
    ) -> std::result::Result<(), TransportError> {
        match tokio::time::timeout(self.connection_timeout, transport.start()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                force_close(config, transport).await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    server_id = %config.id,
                    "Transport did not start within {:?}, closing it",
                    self.connection_timeout
                );
                force_close(config, transport).await;
                Err(TransportError::Timeout(self.connection_timeout))
            }
        }
    }
}

#[async_trait]
impl TransportBuilder for TransportFactory {
    async fn create_transport(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<Arc<dyn Transport>> {
        let result = async {
            config.validate()?;
            let transport = self.build(config, request_headers)?;
            attach_logging(config, transport.as_ref());
            self.start_guarded(config, &transport)
                .await
                .map_err(|source| transport_error(config, source))?;
            Ok::<_, ProxyError>(transport)
        }
        .await;

        if let Err(e) = &result {
            error!(
                server_id = %config.id,
                server_name = %config.name,
                "Failed to create transport: {}",
                e
            );
        }
        result
    }
}

fn transport_error(config: &ServerConfig, source: TransportError) -> ProxyError {
    ProxyError::Transport {
        server: config.display_name().to_string(),
        source,
    }
}

async fn force_close(config: &ServerConfig, transport: &Arc<dyn Transport>) {
    if let Err(e) = transport.close().await {
        debug!(server_id = %config.id, "Error closing failed transport: {}", e);
    }
}

fn attach_logging(config: &ServerConfig, transport: &dyn Transport) {
    let server_id = config.id.clone();
    let kind = transport.name();
    transport.hooks().on_close(move || {
        info!(server_id = %server_id, "{} transport closed", kind);
    });
    let server_id = config.id.clone();
    transport.hooks().on_error(move |e| {
        warn!(server_id = %server_id, "{} transport error: {}", kind, e);
    });
}

/// Layer the environment: process env, then proxy defaults, then the server's own env.
pub fn merge_env(
    base: &HashMap<String, String>,
    defaults: &HashMap<String, String>,
    config: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = base.clone();
    env.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Split a shell-style command line and look the program up on `path`.
///
/// Words after the program in `command` come before `args`. A program that
/// cannot be found is returned as given, so the spawn reports the failure.
pub fn resolve_command(
    command: &str,
    args: &[String],
    path: Option<&String>,
) -> Result<(PathBuf, Vec<String>)> {
    let mut words = shlex::split(command).ok_or_else(|| ConfigError::InvalidCommand {
        command: command.to_string(),
    })?;
    if words.is_empty() {
        return Err(ConfigError::InvalidCommand {
            command: command.to_string(),
        }
        .into());
    }
    let program = words.remove(0);
    words.extend(args.iter().cloned());

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let resolved = match which::which_in(&program, path, cwd) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!("Could not resolve '{}' on PATH: {}", program, e);
            PathBuf::from(&program)
        }
    };
    Ok((resolved, words))
}

/// Accept negotiation, then the server's configured headers, then allow-listed inbound headers.
pub fn build_request_headers(
    config: &ServerConfig,
    inbound: Option<&HeaderMap>,
) -> Result<HeaderMap> {
    let (accept, passthrough) = match config.kind {
        TransportKind::Sse => ("text/event-stream", SSE_PASSTHROUGH_HEADERS),
        _ => (
            "text/event-stream, application/json",
            STREAMABLE_HTTP_PASSTHROUGH_HEADERS,
        ),
    };

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept));

    for (name, value) in &config.headers {
        let invalid = |reason: String| ConfigError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
    }

    if let Some(inbound) = inbound {
        for name in passthrough {
            if let Some(value) = inbound.get(*name) {
                headers.insert(HeaderName::from_static(*name), value.clone());
            }
        }
        if headers.contains_key(AUTHORIZATION) {
            debug!("Forwarding authorization header to {}", config.display_name());
        }
    }
    Ok(headers)
}
