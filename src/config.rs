use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::utils::{DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Environment variable holding a JSON object of default env overrides for stdio servers.
pub const MCP_ENV_VARS: &str = "MCP_ENV_VARS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Server '{server}' uses the stdio transport but has no command")]
    MissingCommand { server: String },
    #[error("Server '{server}' uses the {kind} transport but has no url")]
    MissingUrl { server: String, kind: TransportKind },
    #[error("Invalid command line '{command}': unbalanced quotes")]
    InvalidCommand { command: String },
    #[error("Invalid server URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("Invalid environment JSON in {origin}: {source}")]
    InvalidEnvJson {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// How the proxy reaches a backing MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a backing MCP server.
///
/// Only the fields of the declared `type` are consulted: `command`, `args` and
/// `env` for stdio, `url` and `headers` for the network transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ServerConfig {
    /// A config of the given kind with every optional field empty.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
        }
    }

    pub fn stdio(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::new(id, name, TransportKind::Stdio)
        }
    }

    pub fn sse(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(id, name, TransportKind::Sse)
        }
    }

    pub fn streamable_http(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(id, name, TransportKind::StreamableHttp)
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Check that the fields required by the declared transport kind are present.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            TransportKind::Stdio => match self.command.as_deref() {
                Some(command) if !command.trim().is_empty() => Ok(()),
                _ => Err(ConfigError::MissingCommand {
                    server: self.display_name().to_string(),
                }),
            },
            TransportKind::Sse | TransportKind::StreamableHttp => self.parsed_url().map(|_| ()),
        }
    }

    /// The declared URL of a network server, parsed.
    pub fn parsed_url(&self) -> Result<Url> {
        let raw = match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => url,
            _ => {
                return Err(ConfigError::MissingUrl {
                    server: self.display_name().to_string(),
                    kind: self.kind,
                })
            }
        };
        Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Settings shared by the registry and the transport factory.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub max_connections: usize,
    pub connection_timeout: Duration,
    /// Layered over the process environment of every stdio server, below the per-server env.
    pub default_env: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            default_env: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Defaults, with the default env seeded from `MCP_ENV_VARS`.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(MCP_ENV_VARS).ok();
        let default_env = parse_env_json(MCP_ENV_VARS, raw.as_deref())?;
        debug!("Loaded {} default environment variables", default_env.len());
        Ok(Self {
            default_env,
            ..Self::default()
        })
    }
}

/// Parse a JSON object of environment variables. Absent or blank input yields an empty map.
pub fn parse_env_json(origin: &str, raw: Option<&str>) -> Result<HashMap<String, String>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(HashMap::new()),
        Some(json) => serde_json::from_str(json).map_err(|source| ConfigError::InvalidEnvJson {
            origin: origin.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_requires_command() {
        let mut config = ServerConfig::stdio("a", "alpha", "node", vec![]);
        assert!(config.validate().is_ok());

        config.command = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCommand { .. })
        ));

        config.command = Some("   ".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCommand { .. })
        ));
    }

    #[test]
    fn test_network_kinds_require_url() {
        for mut config in [
            ServerConfig::sse("b", "beta", "http://localhost:3001/sse"),
            ServerConfig::streamable_http("c", "gamma", "http://localhost:3001/mcp"),
        ] {
            assert!(config.validate().is_ok());
            config.url = None;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::MissingUrl { .. })
            ));
            config.url = Some("not a url".to_string());
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidUrl { .. })
            ));
        }
    }

    #[test]
    fn test_deserialize_server_config() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "id": "everything",
                "name": "Everything",
                "type": "streamable-http",
                "url": "http://localhost:3001/mcp",
                "headers": {"x-api-key": "secret"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.kind, TransportKind::StreamableHttp);
        assert_eq!(config.headers.get("x-api-key").unwrap(), "secret");
        assert!(config.args.is_empty());
        assert!(config.command.is_none());
    }

    #[test]
    fn test_parse_env_json() {
        assert!(parse_env_json(MCP_ENV_VARS, None).unwrap().is_empty());
        assert!(parse_env_json(MCP_ENV_VARS, Some("  ")).unwrap().is_empty());

        let env = parse_env_json(MCP_ENV_VARS, Some(r#"{"API_KEY":"k","DEBUG":"1"}"#)).unwrap();
        assert_eq!(env.get("API_KEY").unwrap(), "k");
        assert_eq!(env.len(), 2);

        assert!(matches!(
            parse_env_json(MCP_ENV_VARS, Some("[1, 2]")),
            Err(ConfigError::InvalidEnvJson { .. })
        ));
    }
}
