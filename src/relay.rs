/**
 * Message pump between the two halves of a proxied session.
 *
 * Each direction has its own FIFO drained by a single task. Sends are started
 * in the order frames were received, but a slow send does not hold back the
 * frames behind it. Closing either side closes the other.
 */
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::transport::{request_id, JsonRpcMessage, Transport};

/// JSON-RPC error code returned to the origin of a request that could not be forwarded.
pub const FORWARD_ERROR_CODE: i64 = -32001;

/// Sends a single direction may have outstanding before it stops taking frames.
const MAX_IN_FLIGHT: usize = 64;

/// Handles to the two pump tasks of a bridge.
pub struct Relay {
    client_to_server: JoinHandle<()>,
    server_to_client: JoinHandle<()>,
}

impl Relay {
    /// Both pumps drain once their source transports close.
    pub fn is_finished(&self) -> bool {
        self.client_to_server.is_finished() && self.server_to_client.is_finished()
    }

    /// Wait for both directions to drain.
    pub async fn join(self) {
        let _ = self.client_to_server.await;
        let _ = self.server_to_client.await;
    }

    pub fn abort(&self) {
        self.client_to_server.abort();
        self.server_to_client.abort();
    }
}

/// Forward every message received on either transport to the other, verbatim.
pub fn bridge(
    transport_to_client: Arc<dyn Transport>,
    transport_to_server: Arc<dyn Transport>,
) -> Relay {
    let client_to_server = pump("client", &transport_to_client, &transport_to_server);
    let server_to_client = pump("server", &transport_to_server, &transport_to_client);

    cascade_close(&transport_to_client, &transport_to_server);
    cascade_close(&transport_to_server, &transport_to_client);

    Relay {
        client_to_server,
        server_to_client,
    }
}

fn pump(
    origin: &'static str,
    from: &Arc<dyn Transport>,
    to: &Arc<dyn Transport>,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    from.hooks().on_message(move |message| {
        if tx.send(message).is_err() {
            debug!("Relay from {} already stopped", origin);
        }
    });

    let source: Weak<dyn Transport> = Arc::downgrade(from);
    let target = to.clone();
    tokio::spawn(async move {
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                // Polling in-flight sends first gives each new send its first
                // poll before the next frame is taken
                biased;
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                message = rx.recv(), if in_flight.len() < MAX_IN_FLIGHT => {
                    let Some(message) = message else { break };
                    in_flight.push(forward(origin, message, target.clone(), source.clone()));
                }
            }
        }
        while in_flight.next().await.is_some() {}
        debug!("Relay from {} finished", origin);
    })
}

/// Send one frame to `target`, answering a failed request on `source`.
async fn forward(
    origin: &'static str,
    message: JsonRpcMessage,
    target: Arc<dyn Transport>,
    source: Weak<dyn Transport>,
) {
    let id = request_id(&message).cloned();
    let Err(e) = target.send(message).await else {
        return;
    };
    error!("Error forwarding message from {}: {}", origin, e);
    let Some(id) = id else { return };

    // Tell the requester its request went nowhere
    let reply = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": FORWARD_ERROR_CODE,
            "message": e.to_string(),
        },
    });
    if let Some(source) = source.upgrade() {
        if let Err(e) = source.send(reply).await {
            warn!("Could not report forwarding error to {}: {}", origin, e);
        }
    }
}

fn cascade_close(closed: &Arc<dyn Transport>, other: &Arc<dyn Transport>) {
    let other: Weak<dyn Transport> = Arc::downgrade(other);
    closed.hooks().on_close(move || {
        let Some(other) = other.upgrade() else { return };
        if other.hooks().is_closed() {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = other.close().await {
                warn!("Error closing peer {} transport: {}", other.name(), e);
            }
        });
    });
}
