use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
/**
 * Web-app facing half of an SSE session.
 *
 * Messages sent on this transport are written to the browser's event stream;
 * messages the browser POSTs to the message endpoint are fed in through
 * [`SseServerTransport::receive`].
 */
use super::{JsonRpcMessage, Transport, TransportError, TransportHooks};
use crate::utils::SessionId;

const CHANNEL_CAPACITY: usize = 64;

pub struct SseServerTransport {
    session_id: SessionId,
    hooks: TransportHooks,
    to_client: mpsc::Sender<JsonRpcMessage>,
    ct: CancellationToken,
}

impl SseServerTransport {
    /// Create the transport and the receiver that feeds the client's event stream.
    ///
    /// The transport closes itself once the receiver is dropped, which is how a
    /// browser disconnect is observed.
    pub fn new(session_id: SessionId) -> (Arc<Self>, mpsc::Receiver<JsonRpcMessage>) {
        let (to_client, to_client_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            session_id,
            hooks: TransportHooks::new(),
            to_client: to_client.clone(),
            ct: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            // Wait for connection closure
            to_client.closed().await;
            if let Some(transport) = weak.upgrade() {
                debug!(session_id = %transport.session_id, "SSE client disconnected");
                transport.ct.cancel();
                transport.hooks.emit_close();
            }
        });

        (transport, to_client_rx)
    }

    /// Cancelled when the transport closes; ends the client's event stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    /// Deliver a message POSTed by the browser.
    pub fn receive(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        self.hooks.emit_message(message);
        Ok(())
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    fn name(&self) -> &'static str {
        "sse-server"
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
        self.to_client
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ct.cancel();
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
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropping_receiver_closes_transport() {
        let (transport, rx) = SseServerTransport::new("session-1".to_string());
        let (tx, closed) = tokio::sync::oneshot::channel();
        transport.hooks().on_close(move || {
            let _ = tx.send(());
        });

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), closed)
            .await
            .unwrap()
            .unwrap();
        assert!(transport.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_send_reaches_event_stream() {
        let (transport, mut rx) = SseServerTransport::new("session-2".to_string());
        let message = json!({"jsonrpc": "2.0", "method": "notifications/message"});
        transport.send(message.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);

        transport.close().await.unwrap();
        assert!(matches!(
            transport.receive(message),
            Err(TransportError::Closed)
        ));
    }
}
