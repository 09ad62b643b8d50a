use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::Client as HttpClient;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
/**
 * Transport to a remote MCP server over the legacy SSE protocol.
 *
 * A long-lived GET stream carries server messages; the server names the POST
 * endpoint for client messages in its first `endpoint` event.
 */
use super::{JsonRpcMessage, Transport, TransportError, TransportHooks};

pub struct SseClientTransport {
    url: Url,
    client: HttpClient,
    headers: HeaderMap,
    endpoint: Arc<Mutex<Option<Url>>>,
    hooks: TransportHooks,
    ct: CancellationToken,
    started: AtomicBool,
}

impl SseClientTransport {
    /// `headers` are sent with the event stream request and every POST.
    pub fn new(url: Url, headers: HeaderMap) -> Result<Self, TransportError> {
        let client = HttpClient::builder().build()?;
        Ok(Self {
            url,
            client,
            headers,
            endpoint: Arc::new(Mutex::new(None)),
            hooks: TransportHooks::new(),
            ct: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("text/event-stream"));
        headers
    }

    /// The POST endpoint announced by the server, once known.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock().clone()
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Protocol(
                "SSE transport already started".to_string(),
            ));
        }
        info!("Connecting to SSE endpoint: {}", self.url);

        // Create SSE stream
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.request_headers())
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus(response.status()));
        }

        let mut events = response.bytes_stream().eventsource();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<Url, TransportError>>();
        let base = self.url.clone();
        let endpoint = self.endpoint.clone();
        let hooks = self.hooks.clone();
        let ct = self.ct.clone();

        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            loop {
                let event = tokio::select! {
                    event = events.next() => event,
                    _ = ct.cancelled() => break,
                };
                match event {
                    Some(Ok(event)) => match event.event.as_str() {
                        "endpoint" => match base.join(event.data.trim()) {
                            Ok(url) => {
                                info!("Message endpoint: {}", url);
                                *endpoint.lock() = Some(url.clone());
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(Ok(url));
                                }
                            }
                            Err(e) => {
                                let reason = format!("invalid endpoint '{}': {}", event.data, e);
                                error!("{}", reason);
                                hooks.emit_error(&TransportError::Protocol(reason.clone()));
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(Err(TransportError::Protocol(reason)));
                                }
                                break;
                            }
                        },
                        "" | "message" => {
                            match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                                Ok(message) => hooks.emit_message(message),
                                Err(e) => {
                                    warn!("Failed to parse SSE message: {}", e);
                                    hooks.emit_error(&TransportError::Json(e));
                                }
                            }
                        }
                        other => debug!("Ignoring SSE event '{}'", other),
                    },
                    Some(Err(e)) => {
                        error!("SSE error: {}", e);
                        hooks.emit_error(&TransportError::EventStream(e.to_string()));
                        break;
                    }
                    None => {
                        debug!("SSE stream ended");
                        break;
                    }
                }
            }
            hooks.emit_close();
        });

        match endpoint_rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        let endpoint = self.endpoint().ok_or(TransportError::NotStarted)?;

        let response = self
            .client
            .post(endpoint)
            .headers(self.request_headers())
            .json(&message)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!("Message POST failed with status: {}", response.status());
            return Err(TransportError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ct.cancel();
        self.hooks.emit_close();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
