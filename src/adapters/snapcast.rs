//! Snapcast routing-daemon client.
//!
//! One WebSocket connection to the multi-room routing/volume daemon. The
//! daemon interleaves command responses and unsolicited notifications on
//! the same channel; every inbound envelope goes through one exhaustive
//! classification, updates the local stream cache where applicable, and is
//! republished raw on the bus. Commands are fire-and-forget: their effects
//! are only observable through the bus.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, SharedBus};
use crate::config::SnapcastConfig;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Per-client volume as the daemon expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientVolume {
    pub muted: bool,
    pub percent: u8,
}

/// One inbound daemon envelope, classified.
#[derive(Debug, PartialEq)]
enum Inbound {
    /// Carries an `error` member. Dropped, never published.
    CommandError(Value),
    /// Full-status response: no `method`, `result.server` present.
    StatusSnapshot { streams: Vec<Value>, envelope: Value },
    /// Everything else is broadcastable, whether or not it answers one of
    /// our requests.
    Event(Value),
}

fn classify(envelope: Value) -> Inbound {
    if envelope.get("error").is_some() {
        return Inbound::CommandError(envelope);
    }

    if envelope.get("method").is_none() {
        if let Some(server) = envelope.pointer("/result/server") {
            let streams = server
                .get("streams")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            return Inbound::StatusSnapshot { streams, envelope };
        }
    }

    Inbound::Event(envelope)
}

fn build_request(method: &str, params: Option<Value>) -> String {
    let id = Uuid::new_v4().to_string();
    let request = match params {
        Some(params) => json!({"id": id, "jsonrpc": "2.0", "method": method, "params": params}),
        None => json!({"id": id, "jsonrpc": "2.0", "method": method}),
    };
    request.to_string()
}

/// The routing-daemon client.
pub struct SnapcastAdapter {
    bus: SharedBus,
    /// Most recent full-status stream list; `None` until the first
    /// snapshot arrives. Replaced wholesale, never merged.
    streams: RwLock<Option<Vec<Value>>>,
    sink: RwLock<Option<WsSink>>,
    shutdown: CancellationToken,
    url: String,
}

impl SnapcastAdapter {
    /// Construct the adapter and start connecting in the background.
    ///
    /// On open the adapter immediately requests a full status so the
    /// stream cache fills without anyone asking.
    pub fn new(config: &SnapcastConfig, bus: SharedBus) -> Arc<Self> {
        let adapter = Arc::new(Self {
            bus,
            streams: RwLock::new(None),
            sink: RwLock::new(None),
            shutdown: CancellationToken::new(),
            url: format!("ws://{}:{}/jsonrpc", config.host, config.port),
        });

        tokio::spawn(adapter.clone().run());

        adapter
    }

    /// Stream list from the most recent snapshot, `None` before the first.
    pub async fn streams(&self) -> Option<Vec<Value>> {
        self.streams.read().await.clone()
    }

    /// Route a source stream to a client group.
    pub async fn assign_stream(&self, stream_id: &str, group_id: &str) {
        self.send(build_request(
            "Group.SetStream",
            Some(json!({"id": group_id, "stream_id": stream_id})),
        ))
        .await;
    }

    /// Set one client's volume.
    pub async fn set_client_volume(&self, client_id: &str, volume: &ClientVolume) {
        self.send(build_request(
            "Client.SetVolume",
            Some(json!({"id": client_id, "volume": volume})),
        ))
        .await;
    }

    /// Ask the daemon for a full status snapshot.
    pub async fn request_status(&self) {
        self.send(build_request("Server.GetStatus", None)).await;
    }

    /// Tear down the connection and its background task.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>) {
        let connect = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
        };

        let ws = match connect {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!("routing daemon connection failed: {e}");
                return;
            }
        };
        let (sink, mut stream) = ws.split();
        *self.sink.write().await = Some(sink);
        info!(url = %self.url, "routing daemon connected");

        self.request_status().await;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_bytes()).await,
                Some(Ok(Message::Binary(bytes))) => self.handle_frame(&bytes).await,
                Some(Ok(Message::Ping(payload))) => {
                    if let Some(sink) = self.sink.write().await.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("routing daemon read error: {e}");
                    break;
                }
            }
        }

        *self.sink.write().await = None;
        debug!("routing daemon connection closed");
    }

    async fn handle_frame(&self, raw: &[u8]) {
        match serde_json::from_slice(raw) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => warn!("discarding unparseable daemon frame: {e}"),
        }
    }

    async fn handle_envelope(&self, envelope: Value) {
        match classify(envelope) {
            // Fail-silent: callers cannot distinguish "failed" from
            // "still pending".
            Inbound::CommandError(envelope) => {
                debug!(?envelope, "dropping daemon error envelope");
            }
            Inbound::StatusSnapshot { streams, envelope } => {
                *self.streams.write().await = Some(streams);
                self.bus.publish(BusEvent::Snapcast(envelope));
            }
            Inbound::Event(envelope) => {
                self.bus.publish(BusEvent::Snapcast(envelope));
            }
        }
    }

    async fn send(&self, request: String) {
        let mut sink = self.sink.write().await;
        let Some(sink) = sink.as_mut() else {
            warn!("routing daemon not connected, dropping command");
            return;
        };
        if let Err(e) = sink.send(Message::Text(request.into())).await {
            warn!("routing daemon send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use tokio::sync::broadcast::error::TryRecvError;

    fn test_adapter() -> (Arc<SnapcastAdapter>, crate::bus::SharedBus) {
        let bus = create_bus();
        // Port 1 is never listening; the background connect fails fast
        // and the adapter behaves like a daemon that went away.
        let config = SnapcastConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        (SnapcastAdapter::new(&config, bus.clone()), bus)
    }

    fn snapshot_envelope() -> Value {
        json!({
            "id": "b32f2b0a-cd25-4b96-9c0b-2797b3b79d0d",
            "jsonrpc": "2.0",
            "result": {
                "server": {
                    "groups": [{"id": "g1", "stream_id": "stream-a"}],
                    "streams": [
                        {"id": "stream-a", "status": "playing"},
                        {"id": "stream-b", "status": "idle"}
                    ]
                }
            }
        })
    }

    #[test]
    fn test_classify_error_envelope() {
        let envelope = json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -32603, "message": "Internal error"}});
        assert!(matches!(classify(envelope), Inbound::CommandError(_)));
    }

    #[test]
    fn test_classify_snapshot() {
        match classify(snapshot_envelope()) {
            Inbound::StatusSnapshot { streams, envelope } => {
                assert_eq!(streams.len(), 2);
                assert_eq!(streams[0]["id"], "stream-a");
                assert_eq!(envelope, snapshot_envelope());
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification_as_event() {
        let envelope = json!({
            "jsonrpc": "2.0",
            "method": "Client.OnVolumeChanged",
            "params": {"id": "c1", "volume": {"muted": false, "percent": 40}}
        });
        assert!(matches!(classify(envelope), Inbound::Event(_)));
    }

    #[test]
    fn test_classify_plain_response_as_event() {
        // A response without a server object is still broadcastable,
        // whether or not it answered one of our requests.
        let envelope = json!({"id": 9, "jsonrpc": "2.0", "result": "ok"});
        assert!(matches!(classify(envelope), Inbound::Event(_)));
    }

    #[test]
    fn test_build_request_shape() {
        let raw = build_request("Group.SetStream", Some(json!({"id": "g1", "stream_id": "s1"})));
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["method"], "Group.SetStream");
        assert_eq!(parsed["params"]["stream_id"], "s1");
        assert!(Uuid::parse_str(parsed["id"].as_str().unwrap()).is_ok());

        let raw = build_request("Server.GetStatus", None);
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.get("params").is_none());
    }

    #[test]
    fn test_build_request_ids_are_fresh() {
        let a: Value = serde_json::from_str(&build_request("Server.GetStatus", None)).unwrap();
        let b: Value = serde_json::from_str(&build_request("Server.GetStatus", None)).unwrap();
        assert_ne!(a["id"], b["id"]);
    }

    #[tokio::test]
    async fn test_error_envelope_is_never_published() {
        let (adapter, bus) = test_adapter();
        let mut rx = bus.subscribe();

        adapter
            .handle_envelope(json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -32603, "message": "boom"}}))
            .await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(adapter.streams().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_replaces_cache_and_publishes_once() {
        let (adapter, bus) = test_adapter();
        let mut rx = bus.subscribe();

        adapter.handle_envelope(snapshot_envelope()).await;

        let streams = adapter.streams().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1]["id"], "stream-b");

        match rx.try_recv().unwrap() {
            BusEvent::Snapcast(envelope) => assert_eq!(envelope, snapshot_envelope()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_later_snapshot_replaces_wholesale() {
        let (adapter, _bus) = test_adapter();

        adapter.handle_envelope(snapshot_envelope()).await;
        adapter
            .handle_envelope(json!({
                "id": "0e5d2a1c-9a43-4d0c-8f66-6f6f0d3a8f21",
                "jsonrpc": "2.0",
                "result": {"server": {"streams": [{"id": "stream-c", "status": "idle"}]}}
            }))
            .await;

        let streams = adapter.streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["id"], "stream-c");
    }

    #[tokio::test]
    async fn test_notifications_are_republished_raw() {
        let (adapter, bus) = test_adapter();
        let mut rx = bus.subscribe();

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "Client.OnVolumeChanged",
            "params": {"id": "c1", "volume": {"muted": false, "percent": 40}}
        });
        adapter.handle_envelope(notification.clone()).await;

        match rx.try_recv().unwrap() {
            BusEvent::Snapcast(envelope) => assert_eq!(envelope, notification),
            other => panic!("unexpected event: {other:?}"),
        }
        // Notifications never touch the snapshot cache.
        assert!(adapter.streams().await.is_none());
    }
}
