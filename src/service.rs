/**
 * Registry of proxied sessions.
 *
 * A session pairs the backing-server transport with at most one web-app
 * transport. All three session tables sit behind a single lock that is never
 * held across an await or while transport hooks run.
 */
use futures::future::join_all;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{ProxyConfig, ServerConfig};
use crate::error::{ProxyError, Result};
use crate::factory::{TransportBuilder, TransportFactory};
use crate::relay::{self, Relay};
use crate::transport::sse_server::SseServerTransport;
use crate::transport::streamable_http_server::StreamableHttpServerTransport;
use crate::transport::{JsonRpcMessage, Transport, TransportError};
use crate::utils::{new_session_id, now_millis, SessionId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub id: SessionId,
    pub status: ConnectionState,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
    pub error_count: u32,
}

impl ConnectionStatus {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            status: ConnectionState::Connecting,
            last_activity: now_millis(),
            error_count: 0,
        }
    }
}

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Connection {
        session_id: SessionId,
        config: ServerConfig,
    },
    Disconnection {
        session_id: SessionId,
    },
    Error {
        session_id: SessionId,
        error: String,
    },
}

/// A session whose web-app side is an SSE stream.
pub struct SseSession {
    pub session_id: SessionId,
    pub transport: Arc<SseServerTransport>,
    /// Frames to write to the browser's event stream.
    pub outbound: mpsc::Receiver<JsonRpcMessage>,
}

/// A session whose web-app side is Streamable HTTP.
pub struct StreamableHttpSession {
    pub session_id: SessionId,
    pub transport: Arc<StreamableHttpServerTransport>,
}

#[derive(Default)]
struct Tables {
    statuses: HashMap<SessionId, ConnectionStatus>,
    server_transports: HashMap<SessionId, Arc<dyn Transport>>,
    web_transports: HashMap<SessionId, Arc<dyn Transport>>,
}

struct Inner {
    config: ProxyConfig,
    builder: Arc<dyn TransportBuilder>,
    tables: Mutex<Tables>,
    events: broadcast::Sender<ProxyEvent>,
}

#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Inner>,
}

impl ProxyService {
    pub fn new(config: ProxyConfig) -> Self {
        let factory = TransportFactory::from_config(&config);
        Self::with_builder(config, Arc::new(factory))
    }

    /// Use a custom transport builder instead of the default factory.
    pub fn with_builder(config: ProxyConfig, builder: Arc<dyn TransportBuilder>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                builder,
                tables: Mutex::new(Tables::default()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.events.subscribe()
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn emit(&self, event: ProxyEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Reserve a slot and record the session as connecting, or reject when full.
    fn admit(&self) -> Result<SessionId> {
        let mut tables = self.inner.tables.lock();
        let max = self.inner.config.max_connections;
        if tables.statuses.len() >= max {
            return Err(ProxyError::Capacity { max });
        }
        let session_id = new_session_id();
        tables
            .statuses
            .insert(session_id.clone(), ConnectionStatus::new(session_id.clone()));
        Ok(session_id)
    }

    /// Open a backing-server connection and register it under a fresh session id.
    pub async fn create_connection(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<SessionId> {
        let session_id = self.admit()?;
        info!(
            session_id = %session_id,
            server_id = %config.id,
            "Creating {} connection to {}",
            config.kind,
            config.display_name()
        );

        let transport = match self
            .inner
            .builder
            .create_transport(config, request_headers)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!(
                    session_id = %session_id,
                    server_id = %config.id,
                    "Connection failed: {}",
                    e
                );
                self.set_state(&session_id, ConnectionState::Error);
                self.emit(ProxyEvent::Error {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                });
                self.inner.tables.lock().statuses.remove(&session_id);
                return Err(e);
            }
        };

        let registered = {
            let mut guard = self.inner.tables.lock();
            let tables = &mut *guard;
            match tables.statuses.get_mut(&session_id) {
                Some(status) => {
                    status.status = ConnectionState::Connected;
                    status.last_activity = now_millis();
                    tables
                        .server_transports
                        .insert(session_id.clone(), transport.clone());
                    true
                }
                None => false,
            }
        };
        if !registered {
            // Torn down while the transport was starting
            warn!(session_id = %session_id, "Session removed during connection setup");
            if let Err(e) = transport.close().await {
                debug!(session_id = %session_id, "Error closing orphaned transport: {}", e);
            }
            return Err(ProxyError::SessionNotFound(session_id));
        }

        self.emit(ProxyEvent::Connection {
            session_id: session_id.clone(),
            config: config.clone(),
        });
        self.wire_server_transport(&session_id, transport.as_ref());
        info!(session_id = %session_id, "Connection established");
        Ok(session_id)
    }

    fn wire_server_transport(&self, session_id: &SessionId, transport: &dyn Transport) {
        let weak = self.downgrade();
        let id = session_id.clone();
        transport.hooks().on_error(move |e| {
            if let Some(service) = Self::upgrade(&weak) {
                service.record_error(&id, e);
            }
        });

        let weak = self.downgrade();
        let id = session_id.clone();
        transport.hooks().on_close(move || {
            if let Some(service) = Self::upgrade(&weak) {
                service.handle_transport_closed(&id);
            }
        });
    }

    /// Count an error against the session and publish it.
    fn record_error(&self, session_id: &SessionId, e: &TransportError) {
        {
            let mut tables = self.inner.tables.lock();
            let Some(status) = tables.statuses.get_mut(session_id) else {
                return;
            };
            status.error_count += 1;
            status.status = ConnectionState::Error;
        }
        self.emit(ProxyEvent::Error {
            session_id: session_id.clone(),
            error: e.to_string(),
        });
    }

    fn set_state(&self, session_id: &SessionId, state: ConnectionState) {
        if let Some(status) = self.inner.tables.lock().statuses.get_mut(session_id) {
            status.status = state;
        }
    }

    fn touch(&self, session_id: &SessionId) {
        if let Some(status) = self.inner.tables.lock().statuses.get_mut(session_id) {
            status.last_activity = now_millis();
        }
    }

    /// Remove every table entry for the session. Returns whether this call removed it.
    fn remove_session(
        &self,
        session_id: &SessionId,
    ) -> (bool, Option<Arc<dyn Transport>>, Option<Arc<dyn Transport>>) {
        let mut tables = self.inner.tables.lock();
        let status = tables.statuses.remove(session_id);
        let server = tables.server_transports.remove(session_id);
        let web = tables.web_transports.remove(session_id);
        (status.is_some() || server.is_some() || web.is_some(), server, web)
    }

    fn handle_transport_closed(&self, session_id: &SessionId) {
        let (removed, _, web) = self.remove_session(session_id);
        if !removed {
            return;
        }
        info!(session_id = %session_id, "Backing transport closed, removing session");
        if let Some(web) = web.filter(|web| !web.hooks().is_closed()) {
            tokio::spawn(async move {
                if let Err(e) = web.close().await {
                    warn!("Error closing web app transport: {}", e);
                }
            });
        }
        self.emit(ProxyEvent::Disconnection {
            session_id: session_id.clone(),
        });
    }

    pub fn get_active_connections(&self) -> Vec<SessionId> {
        self.inner
            .tables
            .lock()
            .server_transports
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_connection_status(&self, session_id: &str) -> Option<ConnectionStatus> {
        self.inner.tables.lock().statuses.get(session_id).cloned()
    }

    pub fn get_all_connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.inner
            .tables
            .lock()
            .statuses
            .values()
            .cloned()
            .collect()
    }

    /// Forward a message to the session's backing server.
    pub async fn send_message(&self, session_id: &str, message: JsonRpcMessage) -> Result<()> {
        let session_id = session_id.to_string();
        let transport = self
            .inner
            .tables
            .lock()
            .server_transports
            .get(&session_id)
            .cloned()
            .ok_or_else(|| ProxyError::NoTransport(session_id.clone()))?;

        match transport.send(message).await {
            Ok(()) => {
                if let Some(status) = self.inner.tables.lock().statuses.get_mut(&session_id) {
                    status.status = ConnectionState::Connected;
                    status.last_activity = now_millis();
                }
                Ok(())
            }
            Err(e) => {
                error!(session_id = %session_id, "Failed to send message: {}", e);
                self.record_error(&session_id, &e);
                Err(ProxyError::Send {
                    session_id,
                    source: e,
                })
            }
        }
    }

    pub fn set_web_app_transport(&self, session_id: &str, transport: Arc<dyn Transport>) {
        self.inner
            .tables
            .lock()
            .web_transports
            .insert(session_id.to_string(), transport);
    }

    pub fn get_web_app_transport(&self, session_id: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .tables
            .lock()
            .web_transports
            .get(session_id)
            .cloned()
    }

    pub fn remove_web_app_transport(&self, session_id: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .tables
            .lock()
            .web_transports
            .remove(session_id)
    }

    /// Register the web-app side of a session and relay it to the backing server.
    ///
    /// Closing the web transport closes the whole session.
    pub fn attach_web_app_transport(
        &self,
        session_id: &str,
        web: Arc<dyn Transport>,
    ) -> Result<Relay> {
        let server = {
            let mut tables = self.inner.tables.lock();
            let server = tables
                .server_transports
                .get(session_id)
                .cloned()
                .ok_or_else(|| ProxyError::NoTransport(session_id.to_string()))?;
            tables
                .web_transports
                .insert(session_id.to_string(), web.clone());
            server
        };

        // The relay subscribes first so it also gets anything buffered so far
        let relay = relay::bridge(web.clone(), server.clone());

        for transport in [&web, &server] {
            let weak = self.downgrade();
            let id = session_id.to_string();
            transport.hooks().on_message(move |_| {
                if let Some(service) = Self::upgrade(&weak) {
                    service.touch(&id);
                }
            });
        }

        let weak = self.downgrade();
        let id = session_id.to_string();
        web.hooks().on_close(move || {
            let Some(service) = Self::upgrade(&weak) else {
                return;
            };
            debug!(session_id = %id, "Web app transport closed");
            tokio::spawn(async move { service.close_connection(&id).await });
        });

        Ok(relay)
    }

    /// Tear a session down. Unknown or already closed sessions are a no-op.
    pub async fn close_connection(&self, session_id: &str) {
        let session_id = session_id.to_string();
        let (removed, server, web) = self.remove_session(&session_id);
        if !removed {
            return;
        }
        info!(session_id = %session_id, "Closing connection");

        for transport in server.into_iter().chain(web) {
            if let Err(e) = transport.close().await {
                warn!(
                    session_id = %session_id,
                    "Error closing {} transport: {}",
                    transport.name(),
                    e
                );
            }
        }
        self.emit(ProxyEvent::Disconnection { session_id });
    }

    pub async fn close_all_connections(&self) {
        let ids: Vec<SessionId> = {
            let tables = self.inner.tables.lock();
            let mut ids: Vec<SessionId> = tables.statuses.keys().cloned().collect();
            for id in tables.server_transports.keys() {
                if !tables.statuses.contains_key(id) {
                    ids.push(id.clone());
                }
            }
            ids
        };
        info!("Closing {} connections", ids.len());
        join_all(ids.iter().map(|id| self.close_connection(id))).await;
    }

    /// Open a backing connection and pair it with a Streamable HTTP web transport
    /// that shares its session id.
    pub async fn create_streamable_http_session(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<StreamableHttpSession> {
        let session_id = self.create_connection(config, request_headers).await?;
        let transport = StreamableHttpServerTransport::new(session_id.clone());
        if let Err(e) = self.attach_web_app_transport(&session_id, transport.clone()) {
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(StreamableHttpSession {
            session_id,
            transport,
        })
    }

    /// Open a backing connection and pair it with an SSE web transport that
    /// shares its session id.
    pub async fn create_sse_session(
        &self,
        config: &ServerConfig,
        request_headers: Option<&HeaderMap>,
    ) -> Result<SseSession> {
        let session_id = self.create_connection(config, request_headers).await?;
        let (transport, outbound) = SseServerTransport::new(session_id.clone());
        if let Err(e) = self.attach_web_app_transport(&session_id, transport.clone()) {
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(SseSession {
            session_id,
            transport,
            outbound,
        })
    }
}
