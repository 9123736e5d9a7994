// ABOUTME: A single audio node
// ABOUTME: Health stats and penalty, player registry and inbound message dispatch

use crate::cluster::ClusterEvent;
use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionHandler, SendHandle};
use crate::error::Error;
use crate::events::EventBus;
use crate::gateway::{GatewaySender, UpdateVoiceStatus, VoiceUpdate};
use crate::player::Player;
use crate::protocol::messages::{IncomingMessage, OutgoingMessage, Stats};
use crate::rest::Rest;
use crate::transport::close_code;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Notification emitted by a node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The socket opened and the queue was flushed
    Connect {
        /// Time from dial to ready
        took: Duration,
        /// Whether this was a reconnect
        reconnect: bool,
    },
    /// The socket closed or could not be opened
    Disconnect {
        /// Close code, `None` when no socket was opened
        code: Option<u16>,
        /// Close reason or dial error
        reason: String,
        /// Whether a reconnect will be attempted
        reconnecting: bool,
    },
    /// Reconnect tries are exhausted; only a manual connect recovers
    GaveUp {
        /// Attempts made
        attempts: u32,
    },
    /// A recoverable failure
    Error(Arc<Error>),
    /// A decoded inbound message
    Message(IncomingMessage),
    /// Diagnostic text
    Debug(String),
}

/// Penalty for a stats snapshot; lower is healthier
///
/// CPU load is scored exponentially. When the node reports frame stats
/// (deficit other than -1), deficit and nulled frames add much steeper terms.
pub fn penalty(stats: &Stats) -> f64 {
    let cpu = 1.05f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0;

    let frames = stats.frame_stats.unwrap_or_default();
    if frames.deficit == -1 {
        return cpu;
    }

    let deficit = 1.03f64.powf(500.0 * (frames.deficit as f64 / 3000.0)) * 600.0 - 600.0;
    // nulled frames are doubled twice
    let mut nulled = (1.03f64.powf(500.0 * (frames.nulled as f64 / 3000.0)) * 600.0 - 600.0) * 2.0;
    nulled *= 2.0;

    cpu + deficit + nulled
}

/// One audio node and the players it hosts
pub struct Node {
    config: Arc<NodeConfig>,
    connection: Connection,
    rest: Rest,
    user_id: RwLock<Option<u64>>,
    stats: RwLock<Stats>,
    players: RwLock<HashMap<u64, Arc<Player>>>,
    players_epoch: Arc<AtomicU64>,
    gateway: Arc<dyn GatewaySender>,
    events: EventBus<NodeEvent>,
    upstream: Option<EventBus<ClusterEvent>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.id)
            .field("address", &self.config.address())
            .field("state", &self.connection.state())
            .field("players", &self.players.read().len())
            .finish()
    }
}

impl Node {
    /// Standalone node
    pub fn new<G>(config: NodeConfig, user_id: Option<u64>, gateway: G) -> Arc<Self>
    where
        G: GatewaySender + 'static,
    {
        Self::build(config, user_id, Arc::new(gateway), None, Arc::new(AtomicU64::new(0)))
    }

    pub(crate) fn build(
        config: NodeConfig,
        user_id: Option<u64>,
        gateway: Arc<dyn GatewaySender>,
        upstream: Option<EventBus<ClusterEvent>>,
        players_epoch: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let config = Arc::new(config);

        Arc::new_cyclic(|weak: &Weak<Node>| {
            let handler: Weak<dyn ConnectionHandler> = weak.clone();
            Node {
                connection: Connection::new(Arc::clone(&config), handler),
                rest: Rest::new(&config),
                config,
                user_id: RwLock::new(user_id),
                stats: RwLock::new(Stats::default()),
                players: RwLock::new(HashMap::new()),
                players_epoch,
                gateway,
                events: EventBus::new(),
                upstream,
            }
        })
    }

    /// Identifier from the configuration
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// REST collaborator for this node
    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    /// Bot user id
    pub fn user_id(&self) -> Option<u64> {
        *self.user_id.read()
    }

    /// Whether the socket is open and flushed
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Latest stats snapshot, zero-valued until the node reports one
    pub fn stats(&self) -> Stats {
        self.stats.read().clone()
    }

    /// Penalty of the latest stats snapshot
    pub fn penalty(&self) -> f64 {
        penalty(&self.stats.read())
    }

    /// Listen for node events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Connect, adopting `user_id` if none is set yet
    pub fn connect(&self, user_id: Option<u64>) -> Result<()> {
        if let Some(user_id) = user_id {
            let mut current = self.user_id.write();
            if current.is_none() {
                *current = Some(user_id);
            }
        }

        self.connection.connect()
    }

    /// Close the connection without reconnecting
    pub async fn disconnect(&self) -> Result<()> {
        self.connection
            .disconnect(close_code::NORMAL, "disconnecting...")
            .await
    }

    /// Ping the node; returns whether the connection was open
    pub async fn ping(&self) -> Result<bool> {
        self.connection.ping().await
    }

    /// Send a payload, queueing it while disconnected
    pub fn send(&self, payload: &OutgoingMessage, prioritize: bool) -> SendHandle {
        if let Some(guild_id) = payload.guild_id() {
            log::trace!("[{}] player {} | send {:?}", self.config.id, guild_id, payload);
        }
        self.connection.send(payload, prioritize)
    }

    /// Player for `guild_id`, if one exists
    pub fn player(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.players.read().get(&guild_id).cloned()
    }

    /// Snapshot of this node's players
    pub fn players(&self) -> HashMap<u64, Arc<Player>> {
        self.players.read().clone()
    }

    /// Existing player for `guild_id`, or a newly registered one
    pub fn create_player(self: &Arc<Self>, guild_id: u64) -> Arc<Player> {
        let mut players = self.players.write();
        if let Some(player) = players.get(&guild_id) {
            return Arc::clone(player);
        }

        let player = Arc::new(Player::new(guild_id, Arc::downgrade(self)));
        players.insert(guild_id, Arc::clone(&player));
        drop(players);

        self.players_epoch.fetch_add(1, Ordering::SeqCst);
        log::info!("[{}] Created player for guild {}", self.config.id, guild_id);
        player
    }

    /// Unregister the player for `guild_id` and tell the node to destroy it
    ///
    /// The destroy command is queued, not awaited. Returns whether a player
    /// existed.
    pub fn destroy_player(&self, guild_id: u64) -> bool {
        let removed = self.players.write().remove(&guild_id);
        if removed.is_none() {
            return false;
        }

        self.players_epoch.fetch_add(1, Ordering::SeqCst);
        drop(self.send(&OutgoingMessage::Destroy { guild_id }, false));
        log::info!("[{}] Destroyed player for guild {}", self.config.id, guild_id);
        true
    }

    /// Forward a voice server/state update to the guild's player
    ///
    /// Updates for guilds without a player are ignored.
    pub async fn handle_voice_update(&self, update: impl Into<VoiceUpdate>) -> Result<()> {
        let update = update.into();
        match self.player(update.guild_id()) {
            Some(player) => player.handle_voice_update(update).await,
            None => Ok(()),
        }
    }

    pub(crate) fn send_gateway(&self, guild_id: u64, payload: UpdateVoiceStatus) {
        self.gateway.send(guild_id, payload);
    }

    #[cfg(test)]
    pub(crate) fn players_epoch(&self) -> u64 {
        self.players_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn debug(&self, label: &str, message: &str, guild_id: Option<u64>) {
        let text = match guild_id {
            Some(guild_id) => format!("player {} | {}: {}", guild_id, label, message),
            None => format!("{}: {}", label, message),
        };
        log::debug!("[{}] {}", self.config.id, text);
        self.emit(NodeEvent::Debug(text));
    }

    fn emit(&self, event: NodeEvent) {
        if let Some(upstream) = &self.upstream {
            upstream.emit(ClusterEvent {
                node: self.config.id.clone(),
                event: event.clone(),
            });
        }
        self.events.emit(event);
    }

    #[cfg(test)]
    pub(crate) fn set_stats(&self, stats: Stats) {
        *self.stats.write() = stats;
    }
}

impl ConnectionHandler for Node {
    fn user_id(&self) -> Option<u64> {
        Node::user_id(self)
    }

    fn on_message(&self, text: &str) {
        let message: IncomingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[{}] Dropping malformed message: {}", self.config.id, e);
                self.emit(NodeEvent::Error(Arc::new(e.into())));
                return;
            }
        };

        match &message {
            IncomingMessage::Stats(stats) => *self.stats.write() = stats.clone(),
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(player) = self.player(*guild_id) {
                    player.apply_update(state);
                }
            }
            IncomingMessage::Event(event) => {
                if let Some(player) = self.player(event.guild_id) {
                    player.handle_event(&event.kind);
                }
            }
            IncomingMessage::Unknown => {}
        }

        self.debug("connection", &format!("{} <<< {}", self.config.client_name, text), None);
        self.emit(NodeEvent::Message(message));
    }

    fn on_event(&self, event: NodeEvent) {
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{CpuStats, FrameStats};

    fn stats(load: f64, deficit: i64, nulled: i64) -> Stats {
        Stats {
            cpu: CpuStats {
                system_load: load,
                ..Default::default()
            },
            frame_stats: Some(FrameStats {
                sent: 3000,
                nulled,
                deficit,
            }),
            ..Default::default()
        }
    }

    fn node() -> Arc<Node> {
        Node::new(
            NodeConfig::new("a", "127.0.0.1", 1, "pw"),
            Some(1),
            |_: u64, _: UpdateVoiceStatus| {},
        )
    }

    #[test]
    fn test_penalty_of_idle_node_is_zero() {
        assert_eq!(penalty(&Stats::default()), 0.0);
    }

    #[test]
    fn test_penalty_is_monotonic() {
        assert!(penalty(&stats(0.5, 0, 0)) > penalty(&stats(0.1, 0, 0)));
        assert!(penalty(&stats(0.1, 100, 0)) > penalty(&stats(0.1, 10, 0)));
        assert!(penalty(&stats(0.1, 0, 50)) > penalty(&stats(0.1, 0, 5)));
    }

    #[test]
    fn test_penalty_ignores_frames_without_deficit_reporting() {
        let without = stats(0.3, -1, 500);
        let cpu_only = Stats {
            cpu: without.cpu,
            ..Default::default()
        };
        assert_eq!(penalty(&without), penalty(&cpu_only));
    }

    #[test]
    fn test_nulled_term_is_quadrupled() {
        let nulled = penalty(&stats(0.0, 0, 60));
        let raw = 1.03f64.powf(500.0 * (60.0 / 3000.0)) * 600.0 - 600.0;
        assert!((nulled - raw * 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_create_player_is_idempotent() {
        let node = node();
        let first = node.create_player(10);
        let second = node.create_player(10);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(node.players().len(), 1);
        assert_eq!(node.players_epoch(), 1);
    }

    #[test]
    fn test_destroy_player_queues_destroy() {
        let node = node();
        node.create_player(10);

        assert!(node.destroy_player(10));
        assert!(!node.destroy_player(10));
        assert!(node.player(10).is_none());
        assert_eq!(node.connection().queued(), 1);
        assert_eq!(node.players_epoch(), 2);
    }

    #[test]
    fn test_on_message_dispatch() {
        let node = node();
        let player = node.create_player(42);
        let mut events = node.subscribe();

        node.on_message(r#"{"op":"stats","cpu":{"cores":2,"systemLoad":0.5,"lavalinkLoad":0.1}}"#);
        assert_eq!(node.stats().cpu.system_load, 0.5);

        node.on_message(r#"{"op":"playerUpdate","guildId":"42","state":{"time":1,"position":900,"connected":true}}"#);
        assert_eq!(player.position(), Some(Duration::from_millis(900)));
        assert!(player.is_connected());

        node.on_message(r#"{"op":"event","type":"TrackStartEvent","guildId":"42","track":"abc"}"#);
        assert!(player.is_playing());
        assert_eq!(player.track().as_deref(), Some("abc"));

        node.on_message("not json");

        let mut messages = 0;
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                NodeEvent::Message(_) => messages += 1,
                NodeEvent::Error(_) => errors += 1,
                _ => {}
            }
        }
        assert_eq!(messages, 3);
        assert_eq!(errors, 1);
    }
}
