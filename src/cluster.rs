// ABOUTME: Multi-node cluster
// ABOUTME: Penalty-based node selection, merged player view and event forwarding

use crate::config::ClusterConfig;
use crate::error::Error;
use crate::events::EventBus;
use crate::gateway::{GatewaySender, VoiceUpdate};
use crate::node::{Node, NodeEvent};
use crate::player::Player;
use crate::rest::Rest;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A node event tagged with the node it came from
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// Id of the originating node
    pub node: String,
    /// The event
    pub event: NodeEvent,
}

type PlayerMap = Arc<HashMap<u64, Arc<Player>>>;

/// A fixed set of nodes sharing one bot identity
pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    user_id: RwLock<Option<u64>>,
    events: EventBus<ClusterEvent>,
    players_epoch: Arc<AtomicU64>,
    players_cache: Mutex<Option<(u64, PlayerMap)>>,
    // Serializes player creation and removal so a guild lands on one node
    placement: Mutex<()>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes)
            .field("user_id", &self.user_id())
            .finish()
    }
}

impl Cluster {
    /// Build every configured node; nothing connects until [`init`](Self::init)
    pub fn new<G>(config: ClusterConfig, gateway: G) -> Self
    where
        G: GatewaySender + 'static,
    {
        let gateway: Arc<dyn GatewaySender> = Arc::new(gateway);
        let events = EventBus::new();
        let players_epoch = Arc::new(AtomicU64::new(0));

        let nodes = config
            .nodes
            .into_iter()
            .map(|node| {
                Node::build(
                    node,
                    config.user_id,
                    Arc::clone(&gateway),
                    Some(events.clone()),
                    Arc::clone(&players_epoch),
                )
            })
            .collect();

        Self {
            nodes,
            user_id: RwLock::new(config.user_id),
            events,
            players_epoch,
            players_cache: Mutex::new(None),
            placement: Mutex::new(()),
        }
    }

    /// Bot user id
    pub fn user_id(&self) -> Option<u64> {
        *self.user_id.read()
    }

    /// All nodes in configuration order
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Node by id
    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    /// Listen for events from every node
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Connect every node
    pub fn init(&self, user_id: Option<u64>) -> Result<()> {
        let user_id = {
            let mut current = self.user_id.write();
            if current.is_none() {
                *current = user_id;
            }
            current.ok_or(Error::MissingUserId)?
        };

        for node in &self.nodes {
            node.connect(Some(user_id))?;
        }
        log::info!("Connecting {} node(s) as user {}", self.nodes.len(), user_id);
        Ok(())
    }

    /// Connected nodes, healthiest first
    pub fn ideal_nodes(&self) -> Vec<Arc<Node>> {
        let connected = self.nodes.iter().filter(|node| node.is_connected()).cloned();
        rank(connected)
    }

    /// REST collaborator of the healthiest node
    pub fn rest(&self) -> Result<Rest> {
        self.ideal_nodes()
            .first()
            .map(|node| node.rest().clone())
            .ok_or(Error::NoAvailableNode)
    }

    /// Existing player for `guild_id`, or a new one on `node_id` or the
    /// healthiest node
    pub fn create_player(&self, guild_id: u64, node_id: Option<&str>) -> Result<Arc<Player>> {
        let _placement = self.placement.lock();

        if let Some(player) = self.player(guild_id) {
            return Ok(player);
        }

        let node = match node_id {
            Some(id) => self.node(id).cloned(),
            None => self.ideal_nodes().into_iter().next(),
        }
        .ok_or(Error::NoAvailableNode)?;

        Ok(node.create_player(guild_id))
    }

    /// Destroy the player for `guild_id` wherever it lives
    pub fn destroy_player(&self, guild_id: u64) -> bool {
        let _placement = self.placement.lock();

        self.player(guild_id)
            .and_then(|player| player.node())
            .map(|node| node.destroy_player(guild_id))
            .unwrap_or(false)
    }

    /// Player for `guild_id` on any node
    pub fn player(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.players().get(&guild_id).cloned()
    }

    /// Every player across the cluster
    ///
    /// Cached until a player is created or destroyed on any node.
    pub fn players(&self) -> PlayerMap {
        let epoch = self.players_epoch.load(Ordering::SeqCst);

        let mut cache = self.players_cache.lock();
        if let Some((cached_epoch, players)) = cache.as_ref() {
            if *cached_epoch == epoch {
                return Arc::clone(players);
            }
        }

        let players: PlayerMap = Arc::new(
            self.nodes
                .iter()
                .flat_map(|node| node.players())
                .collect(),
        );
        *cache = Some((epoch, Arc::clone(&players)));
        players
    }

    /// Route a voice server/state update to the guild's player
    ///
    /// Updates for guilds without a player are ignored.
    pub async fn handle_voice_update(&self, update: impl Into<VoiceUpdate>) -> Result<()> {
        let update = update.into();
        match self.player(update.guild_id()) {
            Some(player) => player.handle_voice_update(update).await,
            None => Ok(()),
        }
    }
}

/// Sort nodes by ascending penalty
pub(crate) fn rank(nodes: impl IntoIterator<Item = Arc<Node>>) -> Vec<Arc<Node>> {
    let mut scored: Vec<(f64, Arc<Node>)> = nodes
        .into_iter()
        .map(|node| (node.penalty(), node))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(CmpOrdering::Equal));
    scored.into_iter().map(|(_, node)| node).collect()
}
