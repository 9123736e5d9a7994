// ABOUTME: Node wire message definitions and serialization
// ABOUTME: Outgoing player ops, incoming stats/playerUpdate/event payloads

use crate::player::Filters;
use serde::{Deserialize, Serialize};

/// Serialize 64-bit snowflakes as decimal strings
pub(crate) mod snowflake {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => crate::gateway::parse_snowflake(&s).map_err(de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

/// Message sent to the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// Start playing a track
    #[serde(rename_all = "camelCase")]
    Play {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Encoded track
        track: String,
        /// Start offset in milliseconds
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        /// End offset in milliseconds
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        /// Ignore the request if a track is already playing
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
        /// Initial volume
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
        /// Start paused
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
    },

    /// Stop the current track
    #[serde(rename_all = "camelCase")]
    Stop {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
    },

    /// Pause or resume playback
    #[serde(rename_all = "camelCase")]
    Pause {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Whether playback should be paused
        pause: bool,
    },

    /// Seek within the current track
    #[serde(rename_all = "camelCase")]
    Seek {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Position in milliseconds
        position: u64,
    },

    /// Set the player volume (non-filter mode)
    #[serde(rename_all = "camelCase")]
    Volume {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Volume, 100 is unchanged
        volume: u16,
    },

    /// Replace the active filter set
    #[serde(rename_all = "camelCase")]
    Filters {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Filters to apply
        #[serde(flatten)]
        filters: Filters,
    },

    /// Set equalizer bands (non-filter mode)
    #[serde(rename_all = "camelCase")]
    Equalizer {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Bands to set
        bands: Vec<EqualizerBand>,
    },

    /// Destroy the player on the node
    #[serde(rename_all = "camelCase")]
    Destroy {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
    },

    /// Hand the combined voice credentials to the node
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Voice session id from the state update
        session_id: String,
        /// Raw voice server update
        event: crate::gateway::VoiceServerUpdate,
    },

    /// Enable session resuming for this connection
    ConfigureResuming {
        /// Resume key
        key: String,
        /// Seconds the node keeps the session after a disconnect
        timeout: u64,
    },
}

impl OutgoingMessage {
    /// Guild the message targets, if any
    pub fn guild_id(&self) -> Option<u64> {
        match self {
            OutgoingMessage::Play { guild_id, .. }
            | OutgoingMessage::Stop { guild_id }
            | OutgoingMessage::Pause { guild_id, .. }
            | OutgoingMessage::Seek { guild_id, .. }
            | OutgoingMessage::Volume { guild_id, .. }
            | OutgoingMessage::Filters { guild_id, .. }
            | OutgoingMessage::Equalizer { guild_id, .. }
            | OutgoingMessage::Destroy { guild_id }
            | OutgoingMessage::VoiceUpdate { guild_id, .. } => Some(*guild_id),
            OutgoingMessage::ConfigureResuming { .. } => None,
        }
    }
}

/// Single equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    /// Band index, 0 to 14
    pub band: u8,
    /// Gain, -0.25 to 1.0
    pub gain: f32,
}

impl EqualizerBand {
    /// Create a band
    pub fn new(band: u8, gain: f32) -> Self {
        Self { band, gain }
    }
}

/// Message received from the node
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    /// Periodic health snapshot
    Stats(Stats),

    /// Playback position update
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        /// Guild the player belongs to
        #[serde(with = "snowflake")]
        guild_id: u64,
        /// Reported player state
        state: PlayerState,
    },

    /// Track or voice lifecycle event
    Event(Event),

    /// An op this client does not know about
    #[serde(other)]
    Unknown,
}

/// Player state carried by `playerUpdate`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerState {
    /// Node timestamp in milliseconds
    #[serde(default)]
    pub time: u64,
    /// Track position in milliseconds
    #[serde(default)]
    pub position: Option<u64>,
    /// Whether the node is connected to the voice server, absent on older nodes
    #[serde(default)]
    pub connected: Option<bool>,
}

/// Player event envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Guild the player belongs to
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    /// Event payload
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads, tagged by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    /// A track started playing
    TrackStartEvent {
        /// Encoded track
        #[serde(default)]
        track: Option<String>,
    },

    /// A track finished
    TrackEndEvent {
        /// Encoded track
        #[serde(default)]
        track: Option<String>,
        /// Why it ended
        reason: TrackEndReason,
    },

    /// A track failed to play
    TrackExceptionEvent {
        /// Encoded track
        #[serde(default)]
        track: Option<String>,
        /// Error message
        #[serde(default)]
        error: String,
        /// Structured exception, when provided
        #[serde(default)]
        exception: Option<TrackException>,
    },

    /// A track stopped providing audio
    #[serde(rename_all = "camelCase")]
    TrackStuckEvent {
        /// Encoded track
        #[serde(default)]
        track: Option<String>,
        /// Stuck threshold in milliseconds
        threshold_ms: u64,
    },

    /// The node's voice websocket closed
    #[serde(rename_all = "camelCase")]
    WebSocketClosedEvent {
        /// Close code
        code: u16,
        /// Close reason
        #[serde(default)]
        reason: String,
        /// Whether the voice server closed it
        #[serde(default)]
        by_remote: bool,
    },
}

/// Reason reported with `TrackEndEvent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    /// Track played to the end
    Finished,
    /// Track failed to load
    LoadFailed,
    /// Stopped by a command
    Stopped,
    /// Replaced by a new track
    Replaced,
    /// Player was cleaned up
    Cleanup,
    /// A reason this client does not know about
    #[serde(other)]
    Unknown,
}

impl TrackEndReason {
    /// Whether another track may be started in response
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

/// Exception details from `TrackExceptionEvent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackException {
    /// Exception message
    #[serde(default)]
    pub message: Option<String>,
    /// Severity (COMMON, SUSPICIOUS, FAULT)
    #[serde(default)]
    pub severity: Option<String>,
    /// Underlying cause
    #[serde(default)]
    pub cause: Option<String>,
}

/// Node health snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    /// Players on the node
    pub players: u32,
    /// Players currently playing
    pub playing_players: u32,
    /// Node uptime in milliseconds
    pub uptime: u64,
    /// Memory figures in bytes
    pub memory: MemoryStats,
    /// CPU figures
    pub cpu: CpuStats,
    /// Frame statistics for the last minute, absent right after startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_stats: Option<FrameStats>,
}

/// Memory figures in bytes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    /// Free memory
    pub free: u64,
    /// Used memory
    pub used: u64,
    /// Allocated memory
    pub allocated: u64,
    /// Reservable memory
    pub reservable: u64,
}

/// CPU figures
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    /// Core count
    pub cores: u32,
    /// Host load, 0.0 to 1.0
    pub system_load: f64,
    /// Node process load, 0.0 to 1.0
    pub lavalink_load: f64,
}

/// Audio frame counters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameStats {
    /// Frames sent
    pub sent: i64,
    /// Frames that were null
    pub nulled: i64,
    /// Expected minus sent frames; -1 when not reported
    pub deficit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_play_serializes_guild_as_string() {
        let msg = OutgoingMessage::Play {
            guild_id: 641816570032554014,
            track: "QAAAjQ".to_string(),
            start_time: None,
            end_time: Some(5000),
            no_replace: Some(true),
            volume: None,
            pause: None,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "play",
                "guildId": "641816570032554014",
                "track": "QAAAjQ",
                "endTime": 5000,
                "noReplace": true,
            })
        );
    }

    #[test]
    fn test_configure_resuming_shape() {
        let msg = OutgoingMessage::ConfigureResuming {
            key: "abc".to_string(),
            timeout: 60,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"op": "configureResuming", "key": "abc", "timeout": 60}));
        assert_eq!(msg.guild_id(), None);
    }

    #[test]
    fn test_filters_are_flattened() {
        let msg = OutgoingMessage::Filters {
            guild_id: 1,
            filters: Filters {
                volume: Some(0.5),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"op": "filters", "guildId": "1", "volume": 0.5}));
    }

    #[test]
    fn test_parse_stats() {
        let raw = r#"{
            "op": "stats",
            "players": 2,
            "playingPlayers": 1,
            "uptime": 1000,
            "memory": {"free": 1, "used": 2, "allocated": 3, "reservable": 4},
            "cpu": {"cores": 4, "systemLoad": 0.25, "lavalinkLoad": 0.1},
            "frameStats": {"sent": 3000, "nulled": 10, "deficit": 5}
        }"#;

        match serde_json::from_str::<IncomingMessage>(raw).unwrap() {
            IncomingMessage::Stats(stats) => {
                assert_eq!(stats.playing_players, 1);
                assert_eq!(stats.cpu.system_load, 0.25);
                assert_eq!(stats.frame_stats.unwrap().deficit, 5);
            }
            other => panic!("expected stats, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_track_end_event() {
        let raw = r#"{"op":"event","type":"TrackEndEvent","guildId":"42","track":"abc","reason":"REPLACED"}"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();

        assert_eq!(
            msg,
            IncomingMessage::Event(Event {
                guild_id: 42,
                kind: EventKind::TrackEndEvent {
                    track: Some("abc".to_string()),
                    reason: TrackEndReason::Replaced,
                },
            })
        );
    }

    #[test]
    fn test_parse_player_update_and_unknown_op() {
        let raw = r#"{"op":"playerUpdate","guildId":"7","state":{"time":1,"position":1500,"connected":true}}"#;
        match serde_json::from_str::<IncomingMessage>(raw).unwrap() {
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, 7);
                assert_eq!(state.position, Some(1500));
                assert_eq!(state.connected, Some(true));
            }
            other => panic!("expected playerUpdate, got {:?}", other),
        }

        let unknown: IncomingMessage = serde_json::from_str(r#"{"op":"somethingNew"}"#).unwrap();
        assert_eq!(unknown, IncomingMessage::Unknown);
    }

    #[test]
    fn test_unknown_end_reason() {
        let reason: TrackEndReason = serde_json::from_str(r#""SOMETHING""#).unwrap();
        assert_eq!(reason, TrackEndReason::Unknown);
        assert!(TrackEndReason::Finished.may_start_next());
        assert!(!TrackEndReason::Replaced.may_start_next());
    }
}
