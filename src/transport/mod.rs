/**
 * Bidirectional message channels used on both sides of a proxied session.
 *
 * Every channel carries opaque JSON-RPC frames. Consumers subscribe to inbound
 * messages, close and error notifications through [`TransportHooks`]; handlers
 * accumulate in registration order and never replace one another.
 */
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

pub mod memory;
pub mod sse_client;
pub mod sse_server;
pub mod stdio;
pub mod streamable_http_client;
pub mod streamable_http_server;

/// A single JSON-RPC frame. The proxy never looks past the envelope.
pub type JsonRpcMessage = Value;

/// Messages received before anyone subscribes are held, up to this many.
const MAX_PENDING_MESSAGES: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("Event stream error: {0}")]
    EventStream(String),
    #[error("Transport not started")]
    NotStarted,
    #[error("Transport closed")]
    Closed,
    #[error("Timed out after {0:?} waiting for the transport to start")]
    Timeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

type MessageHandler = Box<dyn Fn(JsonRpcMessage) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;
type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

#[derive(Default)]
struct HookState {
    message: Vec<MessageHandler>,
    close: Vec<CloseHandler>,
    error: Vec<ErrorHandler>,
    pending: VecDeque<JsonRpcMessage>,
    closed: bool,
}

/// Subscriber lists for a transport's inbound messages, close and errors.
///
/// Message handlers run while the hook lock is held so that delivery order
/// matches arrival order; they must not subscribe to or emit on the same
/// transport.
#[derive(Clone, Default)]
pub struct TransportHooks {
    state: Arc<Mutex<HookState>>,
}

impl TransportHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to inbound messages. The first subscriber also receives any
    /// messages that arrived before it.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(JsonRpcMessage) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        for message in state.pending.drain(..) {
            handler(message);
        }
        state.message.push(Box::new(handler));
    }

    /// Subscribe to the close notification. Runs immediately if already closed.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            handler();
            return;
        }
        state.close.push(Box::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if !state.closed {
            state.error.push(Arc::new(handler));
        }
    }

    pub fn emit_message(&self, message: JsonRpcMessage) {
        let mut state = self.state.lock();
        if state.closed {
            trace!("Dropping message received after close");
            return;
        }
        if state.message.is_empty() {
            if state.pending.len() >= MAX_PENDING_MESSAGES {
                warn!("No message subscriber yet, dropping oldest buffered message");
                state.pending.pop_front();
            }
            state.pending.push_back(message);
            return;
        }
        for handler in &state.message {
            handler(message.clone());
        }
    }

    pub fn emit_error(&self, error: &TransportError) {
        let handlers = self.state.lock().error.clone();
        for handler in handlers {
            handler(error);
        }
    }

    /// Fire the close handlers once. Returns false if the transport was already closed.
    pub fn emit_close(&self) -> bool {
        let handlers = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.pending.clear();
            state.message.clear();
            state.error.clear();
            std::mem::take(&mut state.close)
        };
        for handler in handlers {
            handler();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A started-on-demand, bidirectional channel of JSON-RPC frames.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short label used in log lines.
    fn name(&self) -> &'static str;

    fn hooks(&self) -> &TransportHooks;

    /// Bring the channel up. Resolves once it can carry messages.
    async fn start(&self) -> Result<(), TransportError>;

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Shut the channel down and fire the close handlers. Safe to call repeatedly.
    async fn close(&self) -> Result<(), TransportError>;

    /// Session identifier negotiated by the transport itself, if any.
    fn session_id(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// The id of a request frame (has both `method` and a non-null `id`).
pub fn request_id(message: &JsonRpcMessage) -> Option<&Value> {
    message.get("method")?;
    message.get("id").filter(|id| !id.is_null())
}

/// The id of a response frame (has `result` or `error`, and no `method`).
pub fn response_id(message: &JsonRpcMessage) -> Option<&Value> {
    if message.get("method").is_some() {
        return None;
    }
    if message.get("result").is_none() && message.get("error").is_none() {
        return None;
    }
    message.get("id").filter(|id| !id.is_null())
}

/// JSON-RPC ids may be numbers or strings; key them by their JSON text.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_close_handlers_chain_in_order() {
        let hooks = TransportHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["framework", "factory", "registry"] {
            let order = order.clone();
            hooks.on_close(move || order.lock().push(label));
        }

        assert!(hooks.emit_close());
        assert!(!hooks.emit_close());
        assert_eq!(*order.lock(), vec!["framework", "factory", "registry"]);
    }

    #[test]
    fn test_on_close_after_close_runs_immediately() {
        let hooks = TransportHooks::new();
        hooks.emit_close();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        hooks.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_messages_buffered_until_first_subscriber() {
        let hooks = TransportHooks::new();
        hooks.emit_message(json!({"jsonrpc": "2.0", "method": "a"}));
        hooks.emit_message(json!({"jsonrpc": "2.0", "method": "b"}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hooks.on_message(move |message| sink.lock().push(message["method"].clone()));
        hooks.emit_message(json!({"jsonrpc": "2.0", "method": "c"}));

        assert_eq!(*seen.lock(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_every_subscriber_sees_each_message() {
        let hooks = TransportHooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            hooks.on_message(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.emit_message(json!({"jsonrpc": "2.0", "method": "ping", "id": 1}));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        hooks.emit_close();
        hooks.emit_message(json!({"jsonrpc": "2.0", "method": "ping", "id": 2}));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_handlers_are_chained() {
        let hooks = TransportHooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            hooks.on_error(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.emit_error(&TransportError::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_frame_classification() {
        let request = json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"});
        let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let response = json!({"jsonrpc": "2.0", "id": "abc", "result": {}});
        let error = json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -1, "message": "x"}});

        assert_eq!(request_id(&request), Some(&json!(7)));
        assert_eq!(request_id(&notification), None);
        assert_eq!(response_id(&request), None);
        assert_eq!(response_id(&response), Some(&json!("abc")));
        assert_eq!(id_key(response_id(&error).unwrap()), id_key(request_id(&request).unwrap()));
    }
}
