use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;
use crate::utils::SessionId;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Maximum number of connections ({max}) reached")]
    Capacity { max: usize },
    #[error("Failed to connect to server '{server}': {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },
    #[error("Failed to send message on session {session_id}: {source}")]
    Send {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },
    #[error("No transport found for session {0}")]
    NoTransport(SessionId),
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
