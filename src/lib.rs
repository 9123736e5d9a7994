// ABOUTME: Main library entry point for lavawire
// ABOUTME: Exports public API for the node client, cluster and players

//! # lavawire
//!
//! Cluster-aware Rust client for Lavalink-style audio nodes.
//!
//! The crate keeps one persistent, authenticated WebSocket connection per node,
//! scores nodes by their reported health and routes new per-guild players to the
//! healthiest one. Playback and voice events flow back through typed event
//! channels.
//!
//! ## Features
//!
//! - **Transport**: RFC 6455 framing over TCP or TLS with a single ordered writer
//! - **Connection**: queued sends, session resuming and backoff-driven reconnects
//! - **Cluster**: penalty-based node selection and a merged player view
//! - **Player**: voice handshake reconciliation and track lifecycle tracking
//!
//! ## Example: Playing a track
//!
//! ```no_run
//! use lavawire::{Cluster, ClusterConfig, NodeConfig, UpdateVoiceStatus};
//!
//! #[tokio::main]
//! async fn main() -> lavawire::Result<()> {
//!     let config = ClusterConfig::new()
//!         .node(NodeConfig::new("main", "localhost", 2333, "youshallnotpass"))
//!         .user_id(568265456499294218);
//!
//!     let cluster = Cluster::new(config, |guild_id: u64, payload: UpdateVoiceStatus| {
//!         // forward `payload` to the gateway shard that owns `guild_id`
//!         let _ = (guild_id, payload);
//!     });
//!     cluster.init(None)?;
//!
//!     let player = cluster.create_player(641816570032554014, None)?;
//!     player.connect(Some(744385395424362577), Default::default())?;
//!     player.play("QAAAjQIAJVJpY2sgQXN0bGV5...", Default::default()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Command-line helpers for the node monitor binary
pub mod cli;
/// Multi-node selection and player aggregation
pub mod cluster;
/// Node and cluster configuration
pub mod config;
/// Connection lifecycle, queueing and reconnects
pub mod connection;
/// Typed publish/subscribe event channels
pub mod events;
/// Chat-platform gateway boundary types
pub mod gateway;
/// A single audio node: health, players and dispatch
pub mod node;
/// Per-guild playback sessions
pub mod player;
/// Wire message definitions
pub mod protocol;
/// HTTP REST collaborator for track loading and route planning
pub mod rest;
/// Raw WebSocket transport
pub mod transport;

pub use cluster::{Cluster, ClusterEvent};
pub use config::{ClusterConfig, NodeConfig, ReconnectPolicy, ResumingOptions};
pub use connection::{Connection, ConnectionState, SendHandle};
pub use gateway::{GatewaySender, UpdateVoiceStatus, VoiceServerUpdate, VoiceStateUpdate, VoiceUpdate};
pub use node::{Node, NodeEvent};
pub use player::{ConnectOptions, Filters, PlayOptions, Player, PlayerEvent};
pub use protocol::messages::{IncomingMessage, OutgoingMessage, Stats};
pub use rest::Rest;

/// Result type for lavawire operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for lavawire
pub mod error {
    use crate::transport::{HandshakeError, TransportError};
    use thiserror::Error;

    /// Error types for lavawire operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// Opening the WebSocket failed
        #[error("WebSocket handshake failed: {0}")]
        Handshake(#[from] HandshakeError),

        /// Frame-level read or write failure
        #[error("Transport error: {0}")]
        Transport(TransportError),

        /// A write was attempted after the socket closed
        #[error("Connection reset: socket has already been closed")]
        ConnectionReset,

        /// No connected node could take a new player
        #[error("No available nodes")]
        NoAvailableNode,

        /// Two equalizer bands were supplied for the same index
        #[error("Band {0} is duplicated 1 or more times")]
        DuplicateBand(u8),

        /// A band index does not fit the equalizer's `u8` range
        #[error("Band index {0} is out of range")]
        BandOutOfRange(usize),

        /// Connecting requires the bot's user id
        #[error("No user id provided, cannot connect")]
        MissingUserId,

        /// The connection was torn down before the payload could be written
        #[error("Connection closed before the payload was sent")]
        Closed,

        /// A snowflake string could not be parsed as a 64-bit id
        #[error("Invalid snowflake: {0}")]
        InvalidSnowflake(String),

        /// A payload could not be encoded or decoded
        #[error("Malformed payload: {0}")]
        Json(#[from] serde_json::Error),

        /// A REST request failed
        #[error("REST error: {0}")]
        Rest(String),
    }

    impl From<TransportError> for Error {
        fn from(err: TransportError) -> Self {
            match err {
                TransportError::ConnectionReset => Error::ConnectionReset,
                other => Error::Transport(other),
            }
        }
    }
}
