use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{JsonRpcMessage, Transport, TransportError, TransportHooks};
use crate::utils::MCP_SESSION_ID_HEADER;

const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Transport to a remote MCP server over Streamable HTTP.
///
/// Every outgoing frame is a POST. Replies come back either as a JSON body or
/// as an event stream attached to that POST. Once the session is initialized a
/// standalone GET stream is opened for server-initiated messages, if the
/// server offers one.
pub struct StreamableHttpClientTransport {
    url: Url,
    client: HttpClient,
    headers: HeaderMap,
    session_id: Arc<Mutex<Option<String>>>,
    hooks: TransportHooks,
    ct: CancellationToken,
    standalone_started: AtomicBool,
}

impl StreamableHttpClientTransport {
    pub fn new(url: Url, headers: HeaderMap) -> Result<Self, TransportError> {
        let client = HttpClient::builder().build()?;
        Ok(Self {
            url,
            client,
            headers,
            session_id: Arc::new(Mutex::new(None)),
            hooks: TransportHooks::new(),
            ct: CancellationToken::new(),
            standalone_started: AtomicBool::new(false),
        })
    }

    /// Configured headers plus the negotiated session id, if any.
    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json, text/event-stream"));
        if let Some(value) = self
            .session_id()
            .and_then(|session_id| HeaderValue::from_str(&session_id).ok())
        {
            headers.insert(MCP_SESSION_ID_HEADER, value);
        }
        headers
    }

    fn open_standalone_stream(&self) {
        if self.standalone_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut headers = self.request_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let request = self.client.get(self.url.clone()).headers(headers);
        let hooks = self.hooks.clone();
        let ct = self.ct.clone();

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Failed to open standalone event stream: {}", e);
                    return;
                }
            };
            match response.status() {
                StatusCode::METHOD_NOT_ALLOWED => {
                    debug!("Server does not offer a standalone event stream");
                }
                status if !status.is_success() => {
                    warn!("Standalone event stream rejected with status: {}", status);
                }
                _ => {
                    debug!("Got standalone event stream");
                    read_event_stream(response, hooks, ct).await;
                }
            }
        });
    }
}

/// Forward every `data` payload of an event stream response to the message hooks.
async fn read_event_stream(response: Response, hooks: TransportHooks, ct: CancellationToken) {
    let mut events = response.bytes_stream().eventsource();
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = ct.cancelled() => break,
        };
        match event {
            Some(Ok(event)) => {
                if event.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(message) => hooks.emit_message(message),
                    Err(e) => {
                        warn!("Failed to deserialize server message: {}", e);
                        hooks.emit_error(&TransportError::Json(e));
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Event stream error: {}", e);
                hooks.emit_error(&TransportError::EventStream(e.to_string()));
                break;
            }
            None => {
                debug!("Event stream terminated");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    fn name(&self) -> &'static str {
        "streamable-http"
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    async fn start(&self) -> Result<(), TransportError> {
        // The session is negotiated by the first POST
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        info!("Connecting to Streamable HTTP endpoint: {}", self.url);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        let completes_initialization =
            message.get("method").and_then(Value::as_str) == Some(INITIALIZED_NOTIFICATION);

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .json(&message)
            .send()
            .await?;

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock() = Some(session_id.to_string());
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            if completes_initialization {
                self.open_standalone_stream();
            }
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransportError::UnexpectedStatus(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type.starts_with("text/event-stream") {
            tokio::spawn(read_event_stream(
                response,
                self.hooks.clone(),
                self.ct.child_token(),
            ));
        } else if content_type.starts_with("application/json") {
            match response.json::<Value>().await? {
                Value::Array(batch) => {
                    for message in batch {
                        self.hooks.emit_message(message);
                    }
                }
                message => self.hooks.emit_message(message),
            }
        } else if content_type.is_empty() {
            debug!("Response without body for status {}", status);
        } else {
            return Err(TransportError::Protocol(format!(
                "unexpected content type: {:?}",
                content_type
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Ok(());
        }
        self.ct.cancel();

        // Terminate the server-side session
        if let Some(session_id) = self.session_id() {
            let result = self
                .client
                .delete(self.url.clone())
                .headers(self.request_headers())
                .send()
                .await;
            match result {
                Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                    info!(session_id = %session_id, "server doesn't support delete session")
                }
                Ok(response) if !response.status().is_success() => {
                    warn!(session_id = %session_id, "delete session failed: {}", response.status())
                }
                Ok(_) => info!(session_id = %session_id, "delete session success"),
                Err(e) => warn!(session_id = %session_id, "fail to delete session: {}", e),
            }
        }

        self.hooks.emit_close();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
