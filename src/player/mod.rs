// ABOUTME: Per-guild playback session
// ABOUTME: Voice handshake reconciliation, track lifecycle state and playback commands

//! Per-guild players.
//!
//! A [`Player`] is created through [`Node::create_player`] or
//! [`Cluster::create_player`](crate::Cluster::create_player) and lives on
//! exactly one node. It mirrors what the node reports about playback and turns
//! track events into [`PlayerEvent`]s.

mod filters;
mod voice;

pub use filters::{ChannelMix, Distortion, Filters, Karaoke, LowPass, Oscillation, Rotation, Timescale};
pub use voice::VoiceSlots;

use crate::error::Error;
use crate::events::EventBus;
use crate::gateway::{UpdateVoiceStatus, VoiceUpdate};
use crate::node::Node;
use crate::protocol::messages::{
    EqualizerBand, EventKind, OutgoingMessage, PlayerState, TrackEndReason, TrackException,
};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Notification emitted by a player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A track started
    TrackStart {
        /// Encoded track
        track: Option<String>,
    },
    /// A track ended
    TrackEnd {
        /// Encoded track
        track: Option<String>,
        /// Why it ended
        reason: TrackEndReason,
    },
    /// A track failed
    TrackException {
        /// Encoded track
        track: Option<String>,
        /// Error reported by the node
        error: String,
        /// Structured exception, when provided
        exception: Option<TrackException>,
    },
    /// A track stopped producing audio; skipping is up to the caller
    TrackStuck {
        /// Encoded track
        track: Option<String>,
        /// Threshold that was exceeded
        threshold: Duration,
    },
    /// The node's voice connection closed
    WebSocketClosed {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
        /// Whether the voice server closed it
        by_remote: bool,
    },
    /// The bot was moved to another voice channel
    MovedChannel(u64),
}

/// Options for [`Player::connect`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Join deafened
    pub deafen: bool,
    /// Join muted
    pub mute: bool,
}

/// Options for [`Player::play`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayOptions {
    /// Start offset
    pub start_time: Option<Duration>,
    /// End offset
    pub end_time: Option<Duration>,
    /// Ignore the request if a track is already playing
    pub no_replace: Option<bool>,
    /// Initial volume
    pub volume: Option<u16>,
    /// Start paused
    pub pause: Option<bool>,
}

#[derive(Debug, Default)]
struct PlayerInner {
    channel_id: Option<u64>,
    position: Option<Duration>,
    track: Option<String>,
    playing: bool,
    playing_since: Option<Instant>,
    paused: bool,
    connected: bool,
    filters: Filters,
    voice: VoiceSlots,
}

/// Playback session for one guild
#[derive(Debug)]
pub struct Player {
    guild_id: u64,
    node: Weak<Node>,
    inner: Mutex<PlayerInner>,
    events: EventBus<PlayerEvent>,
}

impl Player {
    pub(crate) fn new(guild_id: u64, node: Weak<Node>) -> Self {
        Self {
            guild_id,
            node,
            inner: Mutex::new(PlayerInner::default()),
            events: EventBus::new(),
        }
    }

    /// Guild this player belongs to
    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// Node hosting this player, `None` once the node is gone
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    /// Voice channel requested or reported
    pub fn channel_id(&self) -> Option<u64> {
        self.inner.lock().channel_id
    }

    /// Last position reported by the node
    pub fn position(&self) -> Option<Duration> {
        self.inner.lock().position
    }

    /// Track currently playing
    pub fn track(&self) -> Option<String> {
        self.inner.lock().track.clone()
    }

    /// Whether a track is playing
    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }

    /// When the current track started
    pub fn playing_since(&self) -> Option<Instant> {
        self.inner.lock().playing_since
    }

    /// Whether playback is paused
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Whether the node holds voice credentials for this guild
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Active filters
    pub fn filters(&self) -> Filters {
        self.inner.lock().filters.clone()
    }

    /// Listen for player events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn require_node(&self) -> Result<Arc<Node>> {
        self.node.upgrade().ok_or(Error::Closed)
    }

    async fn send(&self, payload: OutgoingMessage) -> Result<()> {
        self.require_node()?.send(&payload, false).await
    }

    /// Ask the gateway to join `channel_id`, or leave with `None`
    ///
    /// This only sends the gateway request; the node connects once both
    /// voice updates have been fed to [`handle_voice_update`](Self::handle_voice_update).
    pub fn connect(&self, channel_id: Option<u64>, options: ConnectOptions) -> Result<()> {
        let node = self.require_node()?;
        self.inner.lock().channel_id = channel_id;

        node.debug(
            "voice",
            &format!("updating voice status, channel={:?}", channel_id),
            Some(self.guild_id),
        );
        node.send_gateway(
            self.guild_id,
            UpdateVoiceStatus::new(self.guild_id, channel_id, options.mute, options.deafen),
        );
        Ok(())
    }

    /// Leave the voice channel
    pub fn disconnect(&self) -> Result<()> {
        self.connect(None, ConnectOptions::default())?;

        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.voice.clear();
        Ok(())
    }

    /// Record one half of the voice handshake
    ///
    /// Returns the combined update once both halves are present. State
    /// updates for other users are ignored.
    pub(crate) fn accept_voice_update(
        &self,
        update: &VoiceUpdate,
        own_user_id: Option<u64>,
    ) -> Option<OutgoingMessage> {
        let mut moved = None;
        let combined = {
            let mut inner = self.inner.lock();
            match update {
                VoiceUpdate::Server(server) => inner.voice.set_server(server.clone()),
                VoiceUpdate::State(state) => {
                    if Some(state.user_id) != own_user_id {
                        return None;
                    }
                    if let Some(channel_id) = state.channel_id {
                        if inner.channel_id != Some(channel_id) {
                            inner.channel_id = Some(channel_id);
                            moved = Some(channel_id);
                        }
                    }
                    inner.voice.set_session(state.session_id.clone());
                }
            }
            inner.voice.combined(self.guild_id)
        };

        if let Some(channel_id) = moved {
            self.events.emit(PlayerEvent::MovedChannel(channel_id));
        }
        combined
    }

    /// Feed a voice server or state update from the gateway
    ///
    /// Once both halves are known the combined `voiceUpdate` is sent and the
    /// player is marked connected.
    pub async fn handle_voice_update(&self, update: impl Into<VoiceUpdate>) -> Result<()> {
        let node = self.require_node()?;
        let Some(payload) = self.accept_voice_update(&update.into(), node.user_id()) else {
            return Ok(());
        };

        node.debug("voice", "submitting voice update", Some(self.guild_id));
        node.send(&payload, false).await?;
        self.inner.lock().connected = true;
        Ok(())
    }

    /// Mirror a `playerUpdate` from the node
    pub(crate) fn apply_update(&self, state: &PlayerState) {
        let mut inner = self.inner.lock();
        inner.position = state.position.map(Duration::from_millis);
        if let Some(connected) = state.connected {
            inner.connected = connected;
        }
    }

    /// Apply a track or voice event from the node
    pub(crate) fn handle_event(&self, event: &EventKind) {
        let notification = {
            let mut inner = self.inner.lock();
            match event {
                EventKind::TrackStartEvent { track } => {
                    inner.playing = true;
                    inner.playing_since = Some(Instant::now());
                    inner.track = track.clone();
                    PlayerEvent::TrackStart {
                        track: track.clone(),
                    }
                }
                EventKind::TrackEndEvent { track, reason } => {
                    if *reason != TrackEndReason::Replaced {
                        inner.playing = false;
                        inner.playing_since = None;
                    }
                    inner.track = None;
                    PlayerEvent::TrackEnd {
                        track: track.clone(),
                        reason: *reason,
                    }
                }
                EventKind::TrackStuckEvent {
                    track,
                    threshold_ms,
                } => PlayerEvent::TrackStuck {
                    track: track.clone(),
                    threshold: Duration::from_millis(*threshold_ms),
                },
                EventKind::TrackExceptionEvent {
                    track,
                    error,
                    exception,
                } => PlayerEvent::TrackException {
                    track: track.clone(),
                    error: error.clone(),
                    exception: exception.clone(),
                },
                EventKind::WebSocketClosedEvent {
                    code,
                    reason,
                    by_remote,
                } => PlayerEvent::WebSocketClosed {
                    code: *code,
                    reason: reason.clone(),
                    by_remote: *by_remote,
                },
            }
        };

        self.events.emit(notification);
    }

    /// Play an encoded track
    pub async fn play(&self, track: impl Into<String>, options: PlayOptions) -> Result<()> {
        let track = track.into();
        self.send(OutgoingMessage::Play {
            guild_id: self.guild_id,
            track: track.clone(),
            start_time: options.start_time.map(|d| d.as_millis() as u64),
            end_time: options.end_time.map(|d| d.as_millis() as u64),
            no_replace: options.no_replace,
            volume: options.volume,
            pause: options.pause,
        })
        .await?;

        let mut inner = self.inner.lock();
        inner.playing = true;
        inner.playing_since = Some(Instant::now());
        inner.track = Some(track);
        if let Some(pause) = options.pause {
            inner.paused = pause;
        }
        Ok(())
    }

    /// Stop the current track
    pub async fn stop(&self) -> Result<()> {
        self.send(OutgoingMessage::Stop {
            guild_id: self.guild_id,
        })
        .await?;

        let mut inner = self.inner.lock();
        inner.playing = false;
        inner.playing_since = None;
        inner.track = None;
        Ok(())
    }

    /// Pause (`true`) or resume (`false`) playback
    pub async fn pause(&self, pause: bool) -> Result<()> {
        self.inner.lock().paused = pause;
        self.send(OutgoingMessage::Pause {
            guild_id: self.guild_id,
            pause,
        })
        .await
    }

    /// Resume playback
    pub async fn resume(&self) -> Result<()> {
        self.pause(false).await
    }

    /// Seek to `position`
    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.send(OutgoingMessage::Seek {
            guild_id: self.guild_id,
            position: position.as_millis() as u64,
        })
        .await
    }

    /// Set the volume, 100 is unchanged
    ///
    /// In filter mode the volume becomes a multiplier on the `volume` filter.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        if self.filter_mode()? {
            let multiplier = if volume > 1 {
                f32::from(volume) / 100.0
            } else {
                f32::from(volume)
            };
            return self.update_filters(|filters| filters.volume = Some(multiplier)).await;
        }

        self.send(OutgoingMessage::Volume {
            guild_id: self.guild_id,
            volume,
        })
        .await
    }

    /// Set equalizer bands
    ///
    /// Fails with [`Error::DuplicateBand`] before any I/O if a band index
    /// appears twice.
    pub async fn set_equalizer(&self, bands: Vec<EqualizerBand>) -> Result<()> {
        check_bands(&bands)?;

        if self.filter_mode()? {
            return self.update_filters(|filters| filters.equalizer = Some(bands)).await;
        }

        self.send(OutgoingMessage::Equalizer {
            guild_id: self.guild_id,
            bands,
        })
        .await
    }

    /// Set equalizer gains, using each gain's index as its band
    ///
    /// Fails with [`Error::BandOutOfRange`] when there are more gains than
    /// band indices.
    pub async fn set_equalizer_gains(&self, gains: &[f32]) -> Result<()> {
        let bands = gains
            .iter()
            .enumerate()
            .map(|(band, gain)| {
                let index = u8::try_from(band).map_err(|_| Error::BandOutOfRange(band))?;
                Ok(EqualizerBand::new(index, *gain))
            })
            .collect::<Result<Vec<_>>>()?;
        self.set_equalizer(bands).await
    }

    /// Replace the filter set and apply it
    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        self.inner.lock().filters = filters;
        self.apply_filters().await
    }

    /// Edit the filter set in place and apply it
    pub async fn update_filters<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Filters),
    {
        edit(&mut self.inner.lock().filters);
        self.apply_filters().await
    }

    /// Send the current filter set
    pub async fn apply_filters(&self) -> Result<()> {
        let filters = self.filters();
        self.send(OutgoingMessage::Filters {
            guild_id: self.guild_id,
            filters,
        })
        .await
    }

    /// Tell the node to destroy this player
    ///
    /// Use [`Node::destroy_player`] to also unregister it locally.
    pub async fn destroy(&self) -> Result<()> {
        self.send(OutgoingMessage::Destroy {
            guild_id: self.guild_id,
        })
        .await
    }

    fn filter_mode(&self) -> Result<bool> {
        Ok(self.require_node()?.config().use_filters)
    }
}

fn check_bands(bands: &[EqualizerBand]) -> Result<()> {
    let mut seen = HashSet::new();
    for band in bands {
        if !seen.insert(band.band) {
            return Err(Error::DuplicateBand(band.band));
        }
    }
    Ok(())
}
