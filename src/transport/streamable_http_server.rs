use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    id_key, request_id, response_id, JsonRpcMessage, Transport, TransportError, TransportHooks,
};
use crate::utils::SessionId;

/// What the HTTP layer should answer to a POST.
pub enum PostOutcome {
    /// Only notifications or responses were posted: reply 202.
    Accepted,
    /// Requests were posted: stream frames back until each has its response.
    Stream(BoxStream<'static, JsonRpcMessage>),
}

#[derive(Default)]
struct Streams {
    by_request: HashMap<String, mpsc::UnboundedSender<JsonRpcMessage>>,
    standalone: Option<mpsc::UnboundedSender<JsonRpcMessage>>,
}

impl Streams {
    /// Forget streams the web app has stopped reading.
    fn prune(&mut self) {
        self.by_request.retain(|_, tx| !tx.is_closed());
        if self.standalone.as_ref().is_some_and(|tx| tx.is_closed()) {
            self.standalone = None;
        }
    }
}

/// Web-app facing half of a Streamable HTTP session.
///
/// Responses are routed to the POST stream that carried the matching request.
/// Other server frames go to the standalone GET stream when one is open, and
/// otherwise to any open POST stream.
pub struct StreamableHttpServerTransport {
    session_id: SessionId,
    hooks: TransportHooks,
    streams: Mutex<Streams>,
    ct: CancellationToken,
}

impl StreamableHttpServerTransport {
    pub fn new(session_id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            hooks: TransportHooks::new(),
            streams: Mutex::new(Streams::default()),
            ct: CancellationToken::new(),
        })
    }

    pub fn handle_post(
        &self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<PostOutcome, TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        let ids: Vec<String> = messages
            .iter()
            .filter_map(request_id)
            .map(id_key)
            .collect();

        if ids.is_empty() {
            for message in messages {
                self.hooks.emit_message(message);
            }
            return Ok(PostOutcome::Accepted);
        }

        // The stream ends once every request sender has been used and dropped
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.streams.lock();
            streams.prune();
            for id in ids {
                streams.by_request.insert(id, tx.clone());
            }
        }
        drop(tx);

        for message in messages {
            self.hooks.emit_message(message);
        }
        Ok(PostOutcome::Stream(self.drain(rx)))
    }

    /// Open the stream for server-initiated frames. Only one may be open at a time.
    pub fn open_standalone_stream(
        &self,
    ) -> Result<BoxStream<'static, JsonRpcMessage>, TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.streams.lock();
            if streams
                .standalone
                .as_ref()
                .is_some_and(|existing| !existing.is_closed())
            {
                return Err(TransportError::Protocol(
                    "standalone stream already open".to_string(),
                ));
            }
            streams.standalone = Some(tx);
        }
        debug!(session_id = %self.session_id, "standalone stream opened");
        Ok(self.drain(rx))
    }

    fn drain(
        &self,
        mut rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) -> BoxStream<'static, JsonRpcMessage> {
        let ct = self.ct.clone();
        Box::pin(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    message = rx.recv() => message,
                    _ = ct.cancelled() => None,
                };
                match next {
                    Some(message) => yield message,
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    fn name(&self) -> &'static str {
        "streamable-http-server"
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut streams = self.streams.lock();
        streams.prune();

        if let Some(id) = response_id(&message) {
            let key = id_key(id);
            return match streams.by_request.remove(&key) {
                Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
                None => Err(TransportError::Protocol(format!(
                    "no open stream for response id {}",
                    key
                ))),
            };
        }

        let target = streams
            .standalone
            .as_ref()
            .or_else(|| streams.by_request.values().next());
        match target {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => {
                warn!(session_id = %self.session_id, "No open stream for server message");
                Err(TransportError::Protocol(
                    "no open stream for server message".to_string(),
                ))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ct.cancel();
        {
            let mut streams = self.streams.lock();
            streams.by_request.clear();
            streams.standalone = None;
        }
        self.hooks.emit_close();
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn expect_stream(outcome: PostOutcome) -> BoxStream<'static, JsonRpcMessage> {
        match outcome {
            PostOutcome::Stream(stream) => stream,
            PostOutcome::Accepted => panic!("expected a response stream"),
        }
    }

    #[tokio::test]
    async fn test_notifications_are_accepted() {
        let transport = StreamableHttpServerTransport::new("s".to_string());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.hooks().on_message(move |message| sink.lock().push(message));

        let outcome = transport
            .handle_post(vec![json!({"jsonrpc": "2.0", "method": "notifications/initialized"})])
            .unwrap();
        assert!(matches!(outcome, PostOutcome::Accepted));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_response_routed_to_request_stream_and_ends_it() {
        let transport = StreamableHttpServerTransport::new("s".to_string());
        transport.hooks().on_message(|_| {});

        let mut stream = expect_stream(
            transport
                .handle_post(vec![json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})])
                .unwrap(),
        );

        let progress = json!({"jsonrpc": "2.0", "method": "notifications/progress"});
        let response = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        transport.send(progress.clone()).await.unwrap();
        transport.send(response.clone()).await.unwrap();

        assert_eq!(stream.next().await, Some(progress));
        assert_eq!(stream.next().await, Some(response));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_server_requests_prefer_standalone_stream() {
        let transport = StreamableHttpServerTransport::new("s".to_string());
        let mut standalone = transport.open_standalone_stream().unwrap();
        assert!(transport.open_standalone_stream().is_err());

        let ping = json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"});
        transport.send(ping.clone()).await.unwrap();
        assert_eq!(standalone.next().await, Some(ping));

        transport.close().await.unwrap();
        assert_eq!(standalone.next().await, None);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_an_error() {
        let transport = StreamableHttpServerTransport::new("s".to_string());
        let result = transport
            .send(json!({"jsonrpc": "2.0", "id": 9, "result": {}}))
            .await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_abandoned_request_streams_are_pruned() {
        let transport = StreamableHttpServerTransport::new("s".to_string());
        transport.hooks().on_message(|_| {});

        let abandoned = expect_stream(
            transport
                .handle_post(vec![json!({"jsonrpc": "2.0", "id": 1, "method": "slow"})])
                .unwrap(),
        );
        drop(abandoned);

        let mut live = expect_stream(
            transport
                .handle_post(vec![json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})])
                .unwrap(),
        );
        assert_eq!(transport.streams.lock().by_request.len(), 1);

        let late = transport
            .send(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
            .await;
        assert!(matches!(late, Err(TransportError::Protocol(_))));

        let pong = json!({"jsonrpc": "2.0", "id": 2, "result": {}});
        transport.send(pong.clone()).await.unwrap();
        assert_eq!(live.next().await, Some(pong));
        assert!(transport.streams.lock().by_request.is_empty());
    }
}
