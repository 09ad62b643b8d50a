/**
 * The entry point for the mcp-inspector-proxy application.
 * It sets up logging and runs the proxy server.
 */
use clap::Parser;
use mcp_inspector_proxy::{
    run_server, ProxyAuth, ProxyConfig, ProxyServerSettings, ProxyService, ServerDefaults,
    TransportKind,
};
use std::{error::Error, net::SocketAddr, time::Duration};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MCP Inspector Proxy CLI arguments
#[derive(Parser)]
#[command(
    name = "mcp-inspector-proxy",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!("MCP Inspector Proxy v",env!("CARGO_PKG_VERSION"),". Relay a web-based MCP inspector to stdio, SSE or Streamable HTTP MCP servers."),
    long_about = None,
    after_help = "Examples:\n  \
        Start the proxy with no default server:\n  \
        mcp-inspector-proxy\n\n  \
        Default to a local stdio server:\n  \
        mcp-inspector-proxy -e KEY VALUE -- npx -y @modelcontextprotocol/server-everything\n\n  \
        Default to a remote server:\n  \
        mcp-inspector-proxy http://localhost:3001/sse\n  \
        mcp-inspector-proxy http://localhost:3001/mcp --transport streamable-http
",
)]
struct Cli {
    /// Default command or URL for sessions that don't name one.
    command_or_url: Option<String>,

    /// Any extra arguments to the default command
    #[arg(last = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Default environment variables for stdio servers. Can be used multiple times.
    #[arg(short = 'e', long = "env", value_names = ["KEY", "VALUE"], number_of_values = 2)]
    env_vars: Vec<String>,

    /// Port to listen on
    #[arg(long = "port", env = "SERVER_PORT", default_value = "6277")]
    port: u16,

    /// Host to listen on. Default is 127.0.0.1
    #[arg(long = "host", env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Default transport type. Options: auto, stdio, sse, streamable-http
    #[arg(long = "transport", default_value = "auto")]
    transport: String,

    /// Maximum number of concurrent sessions
    #[arg(long = "max-connections", default_value = "50")]
    max_connections: usize,

    /// Seconds to wait for a backing server to come up
    #[arg(long = "connection-timeout", default_value = "10")]
    connection_timeout: u64,

    /// Token the web app must present in the X-MCP-Proxy-Auth header. Generated when omitted
    #[arg(long = "auth-token", env = "MCP_PROXY_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Accept requests without a token. Any web page you visit can then start processes
    #[arg(long = "dangerously-omit-auth", env = "DANGEROUSLY_OMIT_AUTH")]
    dangerously_omit_auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cli = Cli::parse();

    // Use the first of the passed args when no command or URL is given
    if cli.command_or_url.is_none() && !cli.args.is_empty() {
        cli.command_or_url = Some(cli.args.remove(0));
    }

    // Check if it's a URL or a command
    let is_url = cli
        .command_or_url
        .as_deref()
        .is_some_and(|value| value.starts_with("http://") || value.starts_with("https://"));

    let transport = match cli.transport.as_str() {
        "auto" => match cli.command_or_url.as_deref() {
            // Auto-detect based on URL pattern
            Some(url) if is_url && url.contains("/sse") => TransportKind::Sse,
            Some(_) if is_url => TransportKind::StreamableHttp,
            _ => TransportKind::Stdio,
        },
        "stdio" => TransportKind::Stdio,
        "sse" => TransportKind::Sse,
        "streamable-http" => TransportKind::StreamableHttp,
        other => {
            eprintln!("Error: unsupported transport type: {}", other);
            std::process::exit(1);
        }
    };

    let defaults = if is_url {
        ServerDefaults {
            transport,
            command: None,
            args: Vec::new(),
            server_url: cli.command_or_url.take(),
        }
    } else {
        ServerDefaults {
            transport,
            command: cli.command_or_url.take(),
            args: cli.args,
            server_url: None,
        }
    };
    debug!("Default server: {:?}", defaults);

    // MCP_ENV_VARS first, then anything passed on the command line
    let mut config = ProxyConfig::from_env()?;
    config.max_connections = cli.max_connections;
    config.connection_timeout = Duration::from_secs(cli.connection_timeout);
    for pair in cli.env_vars.chunks(2) {
        if let [key, value] = pair {
            config.default_env.insert(key.clone(), value.clone());
        }
    }

    let auth = match (cli.dangerously_omit_auth, cli.auth_token) {
        (true, _) => ProxyAuth::Disabled,
        (false, Some(token)) => ProxyAuth::Token(token),
        (false, None) => ProxyAuth::generate(),
    };

    let settings = ProxyServerSettings {
        bind_addr: format!("{}:{}", cli.host, cli.port).parse::<SocketAddr>()?,
        auth,
        defaults,
        ..ProxyServerSettings::default()
    };

    info!(
        "Starting MCP inspector proxy (max {} connections, {:?} connection timeout)",
        config.max_connections, config.connection_timeout
    );
    let service = ProxyService::new(config);
    run_server(service, settings).await?;

    Ok(())
}
