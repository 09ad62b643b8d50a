use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};

use super::{JsonRpcMessage, Transport, TransportError, TransportHooks};

/// One end of an in-process transport pair.
///
/// Whatever is sent on one end is delivered to the other end's message
/// subscribers. Closing either end closes both, like a pipe.
pub struct MemoryTransport {
    hooks: TransportHooks,
    peer: Mutex<Weak<MemoryTransport>>,
}

impl MemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self {
            hooks: TransportHooks::new(),
            peer: Mutex::new(Weak::new()),
        });
        let right = Arc::new(Self {
            hooks: TransportHooks::new(),
            peer: Mutex::new(Arc::downgrade(&left)),
        });
        *left.peer.lock() = Arc::downgrade(&right);
        (left, right)
    }

    fn peer(&self) -> Option<Arc<MemoryTransport>> {
        self.peer.lock().upgrade()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.hooks.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.peer() {
            Some(peer) if !peer.hooks.is_closed() => {
                peer.hooks.emit_message(message);
                Ok(())
            }
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.hooks.emit_close() {
            if let Some(peer) = self.peer() {
                peer.hooks.emit_close();
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
