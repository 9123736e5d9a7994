// ABOUTME: Chat-platform gateway boundary
// ABOUTME: Voice server/state update payloads and the voice status request sender

use crate::protocol::messages::snowflake;
use serde::{Deserialize, Serialize};

/// Sends gateway payloads to the shard that owns a guild
///
/// Implemented for any `Fn(u64, UpdateVoiceStatus)`.
pub trait GatewaySender: Send + Sync {
    /// Send `payload` on behalf of `guild_id`
    fn send(&self, guild_id: u64, payload: UpdateVoiceStatus);
}

impl<F> GatewaySender for F
where
    F: Fn(u64, UpdateVoiceStatus) + Send + Sync,
{
    fn send(&self, guild_id: u64, payload: UpdateVoiceStatus) {
        self(guild_id, payload)
    }
}

/// Parse a snowflake id from its decimal string form
pub fn parse_snowflake(raw: &str) -> crate::Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| crate::error::Error::InvalidSnowflake(raw.to_string()))
}

/// `VOICE_SERVER_UPDATE` dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    /// Voice connection token
    pub token: String,
    /// Voice server host, absent while the server is being reallocated
    pub endpoint: Option<String>,
    /// Guild the voice server belongs to
    #[serde(with = "snowflake")]
    pub guild_id: u64,
}

/// `VOICE_STATE_UPDATE` dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    /// Voice session id
    pub session_id: String,
    /// Channel the user is in, `None` after leaving
    #[serde(default, with = "optional_snowflake")]
    pub channel_id: Option<u64>,
    /// Guild the state belongs to
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    /// User the state belongs to
    #[serde(with = "snowflake")]
    pub user_id: u64,
}

/// Either half of the voice handshake
///
/// Deserializes from the raw dispatch data; payloads carrying a `token` are
/// server updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoiceUpdate {
    /// Voice server half
    Server(VoiceServerUpdate),
    /// Voice state half
    State(VoiceStateUpdate),
}

impl VoiceUpdate {
    /// Guild the update belongs to
    pub fn guild_id(&self) -> u64 {
        match self {
            VoiceUpdate::Server(update) => update.guild_id,
            VoiceUpdate::State(update) => update.guild_id,
        }
    }
}

impl From<VoiceServerUpdate> for VoiceUpdate {
    fn from(update: VoiceServerUpdate) -> Self {
        VoiceUpdate::Server(update)
    }
}

impl From<VoiceStateUpdate> for VoiceUpdate {
    fn from(update: VoiceStateUpdate) -> Self {
        VoiceUpdate::State(update)
    }
}

/// Gateway op 4 payload asking to join, move or leave a voice channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateVoiceStatus {
    /// Always 4
    pub op: u8,
    /// Payload data
    pub d: VoiceStatusData,
}

/// Data of [`UpdateVoiceStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStatusData {
    /// Guild to update
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    /// Channel to join, `None` to leave
    #[serde(with = "optional_snowflake")]
    pub channel_id: Option<u64>,
    /// Join muted
    pub self_mute: bool,
    /// Join deafened
    pub self_deaf: bool,
}

impl UpdateVoiceStatus {
    /// Build an op 4 payload
    pub fn new(guild_id: u64, channel_id: Option<u64>, self_mute: bool, self_deaf: bool) -> Self {
        Self {
            op: 4,
            d: VoiceStatusData {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            },
        }
    }
}

mod optional_snowflake {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.collect_str(id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::parse_snowflake(&s).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}
