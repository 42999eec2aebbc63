//! Mopidy zone client and pool.
//!
//! One `MopidyPlayer` per configured zone, each owning one JSON-RPC
//! WebSocket connection to its playback engine. Every unsolicited engine
//! event is normalized and republished on the shared bus tagged with the
//! zone id, so consumers see N independent zones as one event stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, PlayerEvent, SharedBus};
use crate::config::PlayerConfig;
use crate::rpc::{self, RpcConnection, RpcError};

const MOPIDY_WS_PATH: &str = "mopidy/ws";

/// Track descriptor as the engine reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Length in milliseconds
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<Album>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artist {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Album {
    #[serde(default)]
    pub name: String,
}

/// Playback state enumeration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<&str> for PlaybackState {
    fn from(s: &str) -> Self {
        match s {
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// One player zone.
///
/// The object lives for the whole process; the connection behind it may
/// come and go. While no connection exists, command methods fail with
/// [`RpcError::NotConnected`] and the playing flag reports its last known
/// value.
pub struct MopidyPlayer {
    id: String,
    /// Best-effort cache of the last commanded play/pause state; the
    /// engine may diverge.
    playing: AtomicBool,
    conn: RwLock<Option<RpcConnection>>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl MopidyPlayer {
    /// Construct the player and start connecting in the background.
    ///
    /// Returns immediately; the zone announces itself on the bus with an
    /// `event:online` once the connection is up.
    pub fn new(config: &PlayerConfig, bus: SharedBus) -> Arc<Self> {
        let player = Arc::new(Self {
            id: config.id.clone(),
            playing: AtomicBool::new(false),
            conn: RwLock::new(None),
            bus,
            shutdown: CancellationToken::new(),
        });

        let url = format!("ws://{}:{}/{}/", config.host, config.port, MOPIDY_WS_PATH);
        tokio::spawn(Self::run(player.clone(), url));

        player
    }

    /// Zone identifier, copied from configuration at construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last commanded play/pause state.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Tear down the connection and its background task.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>, url: String) {
        let connect = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = rpc::connect(&url) => result,
        };

        let (conn, mut events) = match connect {
            Ok(pair) => pair,
            Err(e) => {
                warn!(zone = %self.id, "player connection failed: {e}");
                return;
            }
        };
        *self.conn.write().await = Some(conn);
        info!(zone = %self.id, "player online");
        self.mark_online();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(envelope) = event else { break };
            self.publish_engine_event(&envelope);
        }

        // Transport gone: tear down so commands report not-connected.
        if let Some(conn) = self.conn.write().await.take() {
            conn.close();
        }
        debug!(zone = %self.id, "player connection closed");
    }

    /// Fired once per connection lifetime on entering the online state.
    fn mark_online(&self) {
        self.bus
            .publish(BusEvent::Player(PlayerEvent::online(&self.id)));
    }

    fn publish_engine_event(&self, envelope: &Value) {
        let Some(label) = envelope.get("event").and_then(Value::as_str) else {
            return;
        };
        self.bus
            .publish(BusEvent::Player(PlayerEvent::new(&self.id, label)));
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let conn = self.conn.read().await;
        let conn = conn.as_ref().ok_or(RpcError::NotConnected)?;
        conn.call(method, params).await
    }

    /// Currently loaded track, if any.
    pub async fn get_current_track(&self) -> Result<Option<Track>, RpcError> {
        let value = self.call("core.playback.get_current_track", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Current engine playback state.
    pub async fn get_current_state(&self) -> Result<PlaybackState, RpcError> {
        let value = self.call("core.playback.get_state", json!({})).await?;
        Ok(value.as_str().map(PlaybackState::from).unwrap_or_default())
    }

    /// Cover art URI for one track.
    ///
    /// The lookup endpoint is batch-oriented; this always sends a
    /// single-element batch and returns the first image of the result.
    pub async fn get_cover_art(&self, uri: &str) -> Result<Option<String>, RpcError> {
        let result = self
            .call("core.library.get_images", image_batch_params(uri))
            .await?;
        Ok(result
            .get(uri)
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .and_then(|image| image.get("uri"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Search the library across all fields.
    ///
    /// Double-quoted phrases stay single tokens, quote characters are
    /// stripped. Degenerate queries (whitespace or quotes only) still
    /// submit one empty token; the engine decides what that means.
    pub async fn search(&self, query: &str) -> Result<Value, RpcError> {
        let tokens = tokenize_query(query);
        self.call("core.library.search", json!({"query": {"any": tokens}}))
            .await
    }

    /// Replace the queue with one track and start playback.
    ///
    /// The playing flag flips only after the final play call succeeds; a
    /// failure at any step leaves it unchanged and propagates.
    pub async fn play_track(&self, track: &Track) -> Result<(), RpcError> {
        self.call("core.tracklist.clear", json!({})).await?;
        self.call("core.tracklist.add", json!({"uris": [track.uri]}))
            .await?;
        self.call("core.playback.play", json!({})).await?;
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resume playback, or play a specific tracklist entry.
    ///
    /// Optimistic: the flag flips before the engine confirms, unlike
    /// [`Self::play_track`].
    pub async fn play(&self, tlid: Option<u64>) -> Result<(), RpcError> {
        self.playing.store(true, Ordering::SeqCst);
        let params = match tlid {
            Some(tlid) => json!({"tlid": tlid}),
            None => json!({}),
        };
        self.call("core.playback.play", params).await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), RpcError> {
        self.call("core.playback.pause", json!({})).await?;
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Seek to a position in the current track, in milliseconds.
    pub async fn seek(&self, position_ms: u64) -> Result<(), RpcError> {
        self.call("core.playback.seek", json!({"time_position": position_ms}))
            .await?;
        Ok(())
    }

    /// Skip forward. Skips leave the playing flag alone.
    pub async fn next_track(&self) -> Result<(), RpcError> {
        self.call("core.playback.next", json!({})).await?;
        Ok(())
    }

    /// Skip backward. Skips leave the playing flag alone.
    pub async fn previous_track(&self) -> Result<(), RpcError> {
        self.call("core.playback.previous", json!({})).await?;
        Ok(())
    }
}

fn image_batch_params(uri: &str) -> Value {
    json!({"uris": [uri]})
}

fn tokenize_query(query: &str) -> Vec<String> {
    static QUERY_TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = QUERY_TOKEN
        .get_or_init(|| Regex::new(r#""[^"]*"|[^"\s]+"#).expect("query tokenizer regex"));

    let tokens: Vec<String> = re
        .find_iter(query)
        .map(|m| m.as_str().replace('"', ""))
        .collect();
    if tokens.is_empty() {
        vec![String::new()]
    } else {
        tokens
    }
}

/// The set of player zones for the process lifetime.
pub struct MopidyPool {
    players: Vec<Arc<MopidyPlayer>>,
}

impl MopidyPool {
    /// Construct one player per configured zone, in configuration order.
    ///
    /// Construction is synchronous; connections are established in the
    /// background and zones come online independently.
    pub fn new(configs: &[PlayerConfig], bus: &SharedBus) -> Self {
        let players = configs
            .iter()
            .map(|config| MopidyPlayer::new(config, bus.clone()))
            .collect();
        Self { players }
    }

    /// First player whose id matches, or `None`.
    pub fn get_stream_by_id(&self, id: &str) -> Option<Arc<MopidyPlayer>> {
        self.players.iter().find(|p| p.id() == id).cloned()
    }

    pub fn players(&self) -> &[Arc<MopidyPlayer>] {
        &self.players
    }

    pub fn close(&self) {
        for player in &self.players {
            player.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use tokio::sync::broadcast::error::TryRecvError;

    fn player_config(id: &str) -> PlayerConfig {
        // Port 1 is never listening; connections fail fast and the player
        // stays in the not-connected state.
        PlayerConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
        }
    }

    fn recv_player_event(rx: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> PlayerEvent {
        match rx.try_recv().expect("expected a bus event") {
            BusEvent::Player(event) => event,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_tokenize_preserves_quoted_phrases() {
        assert_eq!(
            tokenize_query(r#"foo "bar baz" qux"#),
            vec!["foo", "bar baz", "qux"]
        );
    }

    #[test]
    fn test_tokenize_strips_quotes() {
        assert_eq!(tokenize_query(r#""exact phrase""#), vec!["exact phrase"]);
    }

    #[test]
    fn test_degenerate_queries_submit_one_empty_token() {
        assert_eq!(tokenize_query("   "), vec![""]);
        assert_eq!(tokenize_query("\""), vec![""]);
        assert_eq!(tokenize_query(""), vec![""]);
    }

    #[test]
    fn test_cover_art_lookup_is_a_single_element_batch() {
        assert_eq!(
            image_batch_params("local:track:a.flac"),
            json!({"uris": ["local:track:a.flac"]})
        );
    }

    #[tokio::test]
    async fn test_play_sets_flag_before_the_call_settles() {
        let bus = create_bus();
        let player = MopidyPlayer::new(&player_config("zone-a"), bus);

        // No connection: the command itself fails, but the optimistic
        // update has already happened.
        let result = player.play(None).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert!(player.is_playing());
    }

    #[tokio::test]
    async fn test_play_track_failure_leaves_flag_unchanged() {
        let bus = create_bus();
        let player = MopidyPlayer::new(&player_config("zone-a"), bus);

        let track = Track {
            uri: "local:track:a.flac".to_string(),
            name: None,
            length: None,
            artists: vec![],
            album: None,
        };
        // The queue-clear step fails; the flag must stay at its pre-call
        // value.
        let result = player.play_track(&track).await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn test_pause_failure_leaves_flag_unchanged() {
        let bus = create_bus();
        let player = MopidyPlayer::new(&player_config("zone-a"), bus);

        let _ = player.play(None).await;
        assert!(player.is_playing());

        let result = player.pause().await;
        assert!(matches!(result, Err(RpcError::NotConnected)));
        assert!(player.is_playing());
    }

    #[tokio::test]
    async fn test_online_event_carries_label_and_zone_id() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let player = MopidyPlayer::new(&player_config("kitchen"), bus);

        player.mark_online();

        let event = recv_player_event(&mut rx);
        assert_eq!(event.label, "event:online");
        assert_eq!(event.stream_id, "kitchen");
    }

    #[tokio::test]
    async fn test_engine_events_are_republished_with_prefix() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let player = MopidyPlayer::new(&player_config("kitchen"), bus);

        player.publish_engine_event(&json!({"event": "track_playback_started"}));

        let event = recv_player_event(&mut rx);
        assert_eq!(event.label, "event:track_playback_started");
        assert_eq!(event.stream_id, "kitchen");
        assert_eq!(event.data, json!({}));
    }

    #[tokio::test]
    async fn test_pool_lookup_by_id() {
        let bus = create_bus();
        let pool = MopidyPool::new(&[player_config("a"), player_config("b")], &bus);

        assert_eq!(pool.get_stream_by_id("a").unwrap().id(), "a");
        assert_eq!(pool.get_stream_by_id("b").unwrap().id(), "b");
        assert!(pool.get_stream_by_id("c").is_none());
    }

    #[tokio::test]
    async fn test_pool_duplicate_ids_resolve_to_first() {
        let bus = create_bus();
        let pool = MopidyPool::new(&[player_config("dup"), player_config("dup")], &bus);

        let found = pool.get_stream_by_id("dup").unwrap();
        assert!(Arc::ptr_eq(&found, &pool.players()[0]));
    }

    #[tokio::test]
    async fn test_zones_come_online_independently() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let a = MopidyPlayer::new(&player_config("a"), bus.clone());
        let b = MopidyPlayer::new(&player_config("b"), bus);

        // A comes online while B is still connecting: exactly one event,
        // for A.
        a.mark_online();
        let event = recv_player_event(&mut rx);
        assert_eq!(event.stream_id, "a");
        assert_eq!(event.label, "event:online");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // B follows: one more event, and A's is not re-published.
        b.mark_online();
        let event = recv_player_event(&mut rx);
        assert_eq!(event.stream_id, "b");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
