use async_trait::async_trait;
use mcp_inspector_proxy::config::{ConfigError, ProxyConfig, ServerConfig};
use mcp_inspector_proxy::service::{ConnectionState, ProxyEvent, ProxyService};
use mcp_inspector_proxy::transport::{JsonRpcMessage, Transport, TransportError, TransportHooks};
use mcp_inspector_proxy::{ProxyError, TransportBuilder};
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Backing transport that records what it is sent and rejects `"method": "fail"`.
struct ScriptedTransport {
    hooks: TransportHooks,
    sent: Mutex<Vec<JsonRpcMessage>>,
}

impl ScriptedTransport {
    fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
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
        if message["method"] == "fail" {
            return Err(TransportError::Protocol("rejected".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.hooks.emit_close();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct ScriptedBuilder {
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedBuilder {
    fn created(&self) -> Vec<Arc<ScriptedTransport>> {
        self.created.lock().clone()
    }

    fn last(&self) -> Arc<ScriptedTransport> {
        self.created.lock().last().cloned().expect("no transport created")
    }
}

#[async_trait]
impl TransportBuilder for ScriptedBuilder {
    async fn create_transport(
        &self,
        config: &ServerConfig,
        _request_headers: Option<&http::HeaderMap>,
    ) -> Result<Arc<dyn Transport>, ProxyError> {
        config.validate()?;
        let transport = Arc::new(ScriptedTransport {
            hooks: TransportHooks::new(),
            sent: Mutex::new(Vec::new()),
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

fn service_with(max_connections: usize) -> (ProxyService, Arc<ScriptedBuilder>) {
    let builder = Arc::new(ScriptedBuilder::default());
    let config = ProxyConfig {
        max_connections,
        ..ProxyConfig::default()
    };
    (ProxyService::with_builder(config, builder.clone()), builder)
}

fn server() -> ServerConfig {
    ServerConfig::stdio("everything", "Everything", "npx", vec![])
}

fn drain(events: &mut broadcast::Receiver<ProxyEvent>) -> Vec<ProxyEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn disconnections(events: &[ProxyEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ProxyEvent::Disconnection { .. }))
        .count()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_admission_control() -> anyhow::Result<()> {
    let (service, builder) = service_with(2);

    let first = service.create_connection(&server(), None).await?;
    service.create_connection(&server(), None).await?;
    let rejected = service.create_connection(&server(), None).await;
    assert!(matches!(rejected, Err(ProxyError::Capacity { max: 2 })));
    assert_eq!(builder.created().len(), 2);

    service.close_connection(&first).await;
    service.create_connection(&server(), None).await?;
    assert_eq!(builder.created().len(), 3);
    assert_eq!(service.get_active_connections().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_leaves_no_session() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();

    let mut config = server();
    config.command = None;
    let result = service.create_connection(&config, None).await;

    assert!(matches!(
        result,
        Err(ProxyError::Config(ConfigError::MissingCommand { .. }))
    ));
    assert!(builder.created().is_empty());
    assert!(service.get_all_connection_statuses().is_empty());
    let seen = drain(&mut events);
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], ProxyEvent::Error { .. }));
    Ok(())
}

#[tokio::test]
async fn test_connection_lifecycle_and_idempotent_close() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();

    let session_id = service.create_connection(&server(), None).await?;
    let status = service.get_connection_status(&session_id).unwrap();
    assert_eq!(status.status, ConnectionState::Connected);
    assert_eq!(status.error_count, 0);

    service.close_connection(&session_id).await;
    service.close_connection(&session_id).await;
    service.close_connection("no-such-session").await;

    assert!(builder.last().hooks().is_closed());
    assert!(service.get_connection_status(&session_id).is_none());
    assert!(service.get_active_connections().is_empty());

    let seen = drain(&mut events);
    assert!(matches!(
        &seen[0],
        ProxyEvent::Connection { session_id: id, config }
            if *id == session_id && config.id == "everything"
    ));
    assert_eq!(disconnections(&seen), 1);
    Ok(())
}

#[tokio::test]
async fn test_send_errors_keep_session_registered() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let session_id = service.create_connection(&server(), None).await?;

    let result = service
        .send_message(&session_id, json!({"jsonrpc": "2.0", "id": 1, "method": "fail"}))
        .await;
    assert!(matches!(result, Err(ProxyError::Send { .. })));
    let status = service.get_connection_status(&session_id).unwrap();
    assert_eq!(status.status, ConnectionState::Error);
    assert_eq!(status.error_count, 1);

    service
        .send_message(&session_id, json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await?;
    let status = service.get_connection_status(&session_id).unwrap();
    assert_eq!(status.status, ConnectionState::Connected);
    assert_eq!(status.error_count, 1);
    assert_eq!(builder.last().sent().len(), 1);

    let missing = service.send_message("no-such-session", json!({})).await;
    assert!(matches!(missing, Err(ProxyError::NoTransport(_))));
    Ok(())
}

#[tokio::test]
async fn test_transport_errors_are_counted() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();
    let session_id = service.create_connection(&server(), None).await?;

    builder
        .last()
        .hooks()
        .emit_error(&TransportError::Protocol("bad frame".to_string()));

    let status = service.get_connection_status(&session_id).unwrap();
    assert_eq!(status.status, ConnectionState::Error);
    assert_eq!(status.error_count, 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(
            event,
            ProxyEvent::Error { error, .. } if error.contains("bad frame")
        )));
    Ok(())
}

#[tokio::test]
async fn test_backing_close_tears_down_session() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();
    let session = service.create_sse_session(&server(), None).await?;
    let session_id = session.session_id.clone();
    assert!(service.get_web_app_transport(&session_id).is_some());

    builder.last().close().await?;

    assert!(service.get_connection_status(&session_id).is_none());
    assert!(service.get_web_app_transport(&session_id).is_none());
    wait_until(|| session.transport.hooks().is_closed()).await?;

    // An explicit close after the backing side already went away is a no-op
    service.close_connection(&session_id).await;

    // Let any spawned close handlers run
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnections(&drain(&mut events)), 1);
    assert!(service.get_active_connections().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_web_close_tears_down_backing() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();
    let session = service.create_streamable_http_session(&server(), None).await?;
    let backing = builder.last();

    session.transport.close().await?;
    wait_until(|| backing.hooks().is_closed()).await?;
    wait_until(|| service.get_connection_status(&session.session_id).is_none()).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnections(&drain(&mut events)), 1);
    Ok(())
}

#[tokio::test]
async fn test_sse_session_relays_both_ways_in_order() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut session = service.create_sse_session(&server(), None).await?;
    let backing = builder.last();

    for i in 0..20 {
        session
            .transport
            .receive(json!({"jsonrpc": "2.0", "id": i, "method": "ping"}))?;
        backing
            .hooks()
            .emit_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"n": i},
            }));
    }

    for i in 0..20 {
        let message = tokio::time::timeout(Duration::from_secs(5), session.outbound.recv())
            .await?
            .unwrap();
        assert_eq!(message["params"]["n"], i);
    }
    wait_until(|| backing.sent().len() == 20).await?;
    let ids: Vec<_> = backing.sent().iter().map(|m| m["id"].clone()).collect();
    assert_eq!(ids, (0..20).map(|i| json!(i)).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn test_web_app_transport_table() -> anyhow::Result<()> {
    let (service, _) = service_with(5);
    let session_id = service.create_connection(&server(), None).await?;
    let (web, _outbound) =
        mcp_inspector_proxy::transport::sse_server::SseServerTransport::new(session_id.clone());

    service.set_web_app_transport(&session_id, web);
    assert!(service.get_web_app_transport(&session_id).is_some());
    assert!(service.remove_web_app_transport(&session_id).is_some());
    assert!(service.get_web_app_transport(&session_id).is_none());
    assert!(service.get_connection_status(&session_id).is_some());
    Ok(())
}

#[tokio::test]
async fn test_close_all_connections() -> anyhow::Result<()> {
    let (service, builder) = service_with(5);
    let mut events = service.subscribe();
    for _ in 0..3 {
        service.create_connection(&server(), None).await?;
    }

    service.close_all_connections().await;

    assert!(service.get_all_connection_statuses().is_empty());
    assert!(service.get_active_connections().is_empty());
    assert!(builder.created().iter().all(|t| t.hooks().is_closed()));
    assert_eq!(disconnections(&drain(&mut events)), 3);
    Ok(())
}

#[cfg(unix)]
mod stdio {
    use super::*;

    fn real_service() -> ProxyService {
        ProxyService::new(ProxyConfig {
            connection_timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        })
    }

    #[tokio::test]
    async fn test_exited_server_is_removed() -> anyhow::Result<()> {
        let service = real_service();
        let mut events = service.subscribe();
        let config = ServerConfig::stdio("echo", "echo", "echo", vec!["hello".to_string()]);
        let session_id = service.create_connection(&config, None).await?;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ProxyEvent::Disconnection { session_id: id }) = events.recv().await {
                    if id == session_id {
                        break;
                    }
                }
            }
        })
        .await?;

        let result = service
            .send_message(&session_id, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await;
        assert!(matches!(result, Err(ProxyError::NoTransport(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_to_closed_stdin_counts_error() -> anyhow::Result<()> {
        let service = real_service();
        let config = ServerConfig::stdio(
            "closed-stdin",
            "closed stdin",
            "sh",
            vec!["-c".to_string(), "exec 0<&-; sleep 2".to_string()],
        );
        let session_id = service.create_connection(&config, None).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = service
            .send_message(&session_id, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await;
        assert!(matches!(result, Err(ProxyError::Send { .. })));

        let status = service.get_connection_status(&session_id).unwrap();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.status, ConnectionState::Error);

        service.close_connection(&session_id).await;
        assert!(service.get_connection_status(&session_id).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cat_round_trip_through_session() -> anyhow::Result<()> {
        let service = real_service();
        let config = ServerConfig::stdio("cat", "cat", "cat", vec![]);
        let mut session = service.create_sse_session(&config, None).await?;

        let request = json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"});
        session.transport.receive(request.clone())?;
        let echoed = tokio::time::timeout(Duration::from_secs(5), session.outbound.recv())
            .await?
            .unwrap();
        assert_eq!(echoed, request);

        service.close_all_connections().await;
        assert!(service.get_all_connection_statuses().is_empty());
        Ok(())
    }
}
