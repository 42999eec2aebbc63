//! WebSocket JSON-RPC connection for player zones.
//!
//! One connection multiplexes two flows: responses correlated to our own
//! requests by numeric id, and unsolicited events the engine pushes on the
//! same channel. [`connect`] hands back the command handle and an explicit
//! event subscription; dropping or exhausting the subscription is the
//! signal that the connection is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// Errors surfaced by the JSON-RPC transport.
///
/// Command methods on the zone client propagate these verbatim; nothing is
/// retried or translated on the way up.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,
}

/// A frame the engine sent us, after classification.
#[derive(Debug, PartialEq)]
enum Incoming {
    /// Response to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, (i64, String)>,
    },
    /// Unsolicited event (carries an `event` member, no id).
    Event(Value),
}

/// Classify one inbound JSON payload.
///
/// Returns `None` for frames that are neither a correlatable response nor
/// an event; those are dropped by the reader.
fn parse_frame(payload: &Value) -> Option<Incoming> {
    if let Some(id) = payload.get("id").and_then(Value::as_u64) {
        let outcome = match payload.get("error") {
            Some(error) => Err((
                error.get("code").and_then(Value::as_i64).unwrap_or(0),
                error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(Incoming::Response { id, outcome });
    }

    if payload.get("event").is_some() {
        return Some(Incoming::Event(payload.clone()));
    }

    None
}

/// Unsolicited events from one connection, in arrival order.
///
/// Ends (returns `None`) when the connection closes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventStream {
    /// Next unsolicited event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Command handle for one JSON-RPC connection.
pub struct RpcConnection {
    sink: Arc<Mutex<WsSink>>,
    pending: Pending,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Open a connection and split it into a command handle and the stream of
/// unsolicited events.
pub async fn connect(url: &str) -> Result<(RpcConnection, EventStream), RpcError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (sink, stream) = ws.split();

    let sink = Arc::new(Mutex::new(sink));
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    tokio::spawn(read_loop(
        stream,
        sink.clone(),
        pending.clone(),
        events_tx,
        shutdown.clone(),
    ));

    Ok((
        RpcConnection {
            sink,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
        },
        EventStream { rx: events_rx },
    ))
}

impl RpcConnection {
    /// Issue one request and wait for the matching response.
    ///
    /// No timeout is applied; if the engine never answers, the future never
    /// resolves until the connection is torn down.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        trace!(%method, id, "rpc request");

        let sent = {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(request.to_string().into())).await
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Tear the connection down: the reader exits, every pending call
    /// fails with [`RpcError::ConnectionClosed`] and the event stream ends.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    sink: Arc<Mutex<WsSink>>,
    pending: Pending,
    events_tx: mpsc::UnboundedSender<Value>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!("websocket read error: {e}");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => dispatch(text.as_bytes(), &pending, &events_tx).await,
            Message::Binary(bytes) => dispatch(&bytes, &pending, &events_tx).await,
            Message::Ping(payload) => {
                let _ = sink.lock().await.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: fail every caller still waiting and end the event stream.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(RpcError::ConnectionClosed));
    }
    debug!("rpc connection closed");
}

async fn dispatch(raw: &[u8], pending: &Pending, events_tx: &mpsc::UnboundedSender<Value>) {
    let payload: Value = match serde_json::from_slice(raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("discarding unparseable frame: {e}");
            return;
        }
    };

    match parse_frame(&payload) {
        Some(Incoming::Response { id, outcome }) => {
            let Some(tx) = pending.lock().await.remove(&id) else {
                trace!(id, "response for unknown request id");
                return;
            };
            let _ = tx.send(outcome.map_err(|(code, message)| RpcError::Server { code, message }));
        }
        Some(Incoming::Event(event)) => {
            let _ = events_tx.send(event);
        }
        None => trace!("ignoring frame with neither id nor event"),
    }
}
